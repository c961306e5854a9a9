//! ACID-durable graph store backed by redb.
//!
//! Every [`WriteBatch`] runs inside one redb write transaction, so a batch is
//! either committed in full or discarded. Counters, shard lists and the id
//! high-water mark are ordinary tables and survive restarts.

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};

use crate::concept::{ConceptId, IdAllocator, ResourceIndex, TypeId, TypeLabel};
use crate::error::StoreError;

use super::batch::{BatchTarget, WriteBatch, apply_batch};
use super::{ConceptProperty, Direction, Edge, EdgeId, GraphStore, Property, StoreResult, Vertex};

const VERTICES: TableDefinition<u64, &[u8]> = TableDefinition::new("vertices");
const EDGES: TableDefinition<u64, &[u8]> = TableDefinition::new("edges");
const OUTGOING: MultimapTableDefinition<u64, u64> = MultimapTableDefinition::new("out_edges");
const INCOMING: MultimapTableDefinition<u64, u64> = MultimapTableDefinition::new("in_edges");
const RESOURCE_INDEX: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("resource_index");
const TYPE_LABELS: TableDefinition<&str, u64> = TableDefinition::new("type_labels");
const TYPE_IDS: TableDefinition<u32, u64> = TableDefinition::new("type_ids");
const COUNTERS: TableDefinition<u64, i64> = TableDefinition::new("concept_counts");
const ALLOCATOR: TableDefinition<&str, u64> = TableDefinition::new("allocator");

const NEXT_ID_KEY: &str = "next_id";

fn redb_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode record: {e}"),
    })
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
        message: format!("failed to decode record: {e}"),
    })
}

/// Durable [`GraphStore`] using redb.
pub struct DurableGraphStore {
    db: Arc<Database>,
    ids: IdAllocator,
}

impl DurableGraphStore {
    /// Open or create a store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("graph.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        let store = Self {
            db: Arc::new(db),
            ids: IdAllocator::new(),
        };
        store.create_tables()?;
        let next = store.recover_next_id()?;
        tracing::debug!(path = %db_path.display(), next_id = next, "opened durable graph store");
        Ok(Self {
            ids: IdAllocator::starting_from(next),
            ..store
        })
    }

    fn create_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        open_all(&txn)?;
        txn.commit().map_err(redb_err("commit"))
    }

    /// Highest of the persisted high-water mark and every stored key, plus one.
    fn recover_next_id(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let allocator = txn.open_table(ALLOCATOR).map_err(redb_err("open_table"))?;
        let mut next = allocator
            .get(NEXT_ID_KEY)
            .map_err(redb_err("get"))?
            .map(|g| g.value())
            .unwrap_or(1);
        let vertices = txn.open_table(VERTICES).map_err(redb_err("open_table"))?;
        if let Some((k, _)) = vertices.last().map_err(redb_err("last"))? {
            next = next.max(k.value() + 1);
        }
        let edges = txn.open_table(EDGES).map_err(redb_err("open_table"))?;
        if let Some((k, _)) = edges.last().map_err(redb_err("last"))? {
            next = next.max(k.value() + 1);
        }
        Ok(next)
    }

    fn read_vertex(&self, id: ConceptId) -> StoreResult<Option<Vertex>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(VERTICES).map_err(redb_err("open_table"))?;
        let guard = table.get(id.get()).map_err(redb_err("get"))?;
        guard.map(|g| decode(g.value())).transpose()
    }
}

impl std::fmt::Debug for DurableGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableGraphStore")
            .field("next_id", &self.ids.peek_next())
            .finish()
    }
}

/// Every table opened inside one write transaction.
struct Tables<'txn> {
    vertices: redb::Table<'txn, u64, &'static [u8]>,
    edges: redb::Table<'txn, u64, &'static [u8]>,
    outgoing: redb::MultimapTable<'txn, u64, u64>,
    incoming: redb::MultimapTable<'txn, u64, u64>,
    index: redb::MultimapTable<'txn, &'static str, u64>,
    labels: redb::Table<'txn, &'static str, u64>,
    type_ids: redb::Table<'txn, u32, u64>,
    counters: redb::Table<'txn, u64, i64>,
    allocator: redb::Table<'txn, &'static str, u64>,
}

fn open_all(txn: &redb::WriteTransaction) -> StoreResult<Tables<'_>> {
    Ok(Tables {
        vertices: txn.open_table(VERTICES).map_err(redb_err("open_table"))?,
        edges: txn.open_table(EDGES).map_err(redb_err("open_table"))?,
        outgoing: txn
            .open_multimap_table(OUTGOING)
            .map_err(redb_err("open_multimap_table"))?,
        incoming: txn
            .open_multimap_table(INCOMING)
            .map_err(redb_err("open_multimap_table"))?,
        index: txn
            .open_multimap_table(RESOURCE_INDEX)
            .map_err(redb_err("open_multimap_table"))?,
        labels: txn.open_table(TYPE_LABELS).map_err(redb_err("open_table"))?,
        type_ids: txn.open_table(TYPE_IDS).map_err(redb_err("open_table"))?,
        counters: txn.open_table(COUNTERS).map_err(redb_err("open_table"))?,
        allocator: txn.open_table(ALLOCATOR).map_err(redb_err("open_table"))?,
    })
}

impl BatchTarget for Tables<'_> {
    fn vertex(&mut self, id: ConceptId) -> StoreResult<Option<Vertex>> {
        let guard = self.vertices.get(id.get()).map_err(redb_err("get"))?;
        guard.map(|g| decode(g.value())).transpose()
    }

    fn write_vertex(&mut self, vertex: &Vertex) -> StoreResult<()> {
        let bytes = encode(vertex)?;
        self.vertices
            .insert(vertex.id.get(), bytes.as_slice())
            .map_err(redb_err("insert"))?;
        Ok(())
    }

    fn remove_vertex(&mut self, id: ConceptId) -> StoreResult<()> {
        self.vertices.remove(id.get()).map_err(redb_err("remove"))?;
        self.outgoing.remove_all(id.get()).map_err(redb_err("remove_all"))?;
        self.incoming.remove_all(id.get()).map_err(redb_err("remove_all"))?;
        Ok(())
    }

    fn edge(&mut self, id: EdgeId) -> StoreResult<Option<Edge>> {
        let guard = self.edges.get(id.get()).map_err(redb_err("get"))?;
        guard.map(|g| decode(g.value())).transpose()
    }

    fn write_edge(&mut self, edge: &Edge) -> StoreResult<()> {
        let bytes = encode(edge)?;
        self.edges
            .insert(edge.id.get(), bytes.as_slice())
            .map_err(redb_err("insert"))?;
        self.outgoing
            .insert(edge.source.get(), edge.id.get())
            .map_err(redb_err("insert"))?;
        self.incoming
            .insert(edge.target.get(), edge.id.get())
            .map_err(redb_err("insert"))?;
        Ok(())
    }

    fn remove_edge(&mut self, edge: &Edge) -> StoreResult<()> {
        self.edges.remove(edge.id.get()).map_err(redb_err("remove"))?;
        self.outgoing
            .remove(edge.source.get(), edge.id.get())
            .map_err(redb_err("remove"))?;
        self.incoming
            .remove(edge.target.get(), edge.id.get())
            .map_err(redb_err("remove"))?;
        Ok(())
    }

    fn edge_ids(&mut self, id: ConceptId, direction: Direction) -> StoreResult<Vec<EdgeId>> {
        let mut ids = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            for g in self.outgoing.get(id.get()).map_err(redb_err("get"))? {
                ids.push(EdgeId::new(g.map_err(redb_err("read"))?.value()));
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for g in self.incoming.get(id.get()).map_err(redb_err("get"))? {
                ids.push(EdgeId::new(g.map_err(redb_err("read"))?.value()));
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn index_members(&mut self, index: &ResourceIndex) -> StoreResult<Vec<ConceptId>> {
        let mut ids = Vec::new();
        for g in self.index.get(index.as_str()).map_err(redb_err("get"))? {
            if let Some(id) = ConceptId::new(g.map_err(redb_err("read"))?.value()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn label_owner(&mut self, label: &TypeLabel) -> StoreResult<Option<ConceptId>> {
        Ok(self
            .labels
            .get(label.as_str())
            .map_err(redb_err("get"))?
            .and_then(|g| ConceptId::new(g.value())))
    }

    fn type_id_owner(&mut self, type_id: TypeId) -> StoreResult<Option<ConceptId>> {
        Ok(self
            .type_ids
            .get(type_id.get())
            .map_err(redb_err("get"))?
            .and_then(|g| ConceptId::new(g.value())))
    }

    fn link_property(&mut self, id: ConceptId, property: &Property) -> StoreResult<()> {
        match property {
            Property::Index(index) => {
                self.index
                    .insert(index.as_str(), id.get())
                    .map_err(redb_err("insert"))?;
            }
            Property::Label(label) => {
                self.labels
                    .insert(label.as_str(), id.get())
                    .map_err(redb_err("insert"))?;
            }
            Property::TypeId(type_id) => {
                self.type_ids
                    .insert(type_id.get(), id.get())
                    .map_err(redb_err("insert"))?;
            }
            _ => {}
        }
        Ok(())
    }

    fn unlink_property(&mut self, id: ConceptId, property: &Property) -> StoreResult<()> {
        match property {
            Property::Index(index) => {
                self.index
                    .remove(index.as_str(), id.get())
                    .map_err(redb_err("remove"))?;
            }
            Property::Label(label) => {
                let owned = self
                    .labels
                    .get(label.as_str())
                    .map_err(redb_err("get"))?
                    .map(|g| g.value());
                if owned == Some(id.get()) {
                    self.labels.remove(label.as_str()).map_err(redb_err("remove"))?;
                }
            }
            Property::TypeId(type_id) => {
                let owned = self
                    .type_ids
                    .get(type_id.get())
                    .map_err(redb_err("get"))?
                    .map(|g| g.value());
                if owned == Some(id.get()) {
                    self.type_ids.remove(type_id.get()).map_err(redb_err("remove"))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn counter(&mut self, concept: ConceptId) -> StoreResult<Option<i64>> {
        Ok(self
            .counters
            .get(concept.get())
            .map_err(redb_err("get"))?
            .map(|g| g.value()))
    }

    fn write_counter(&mut self, concept: ConceptId, value: i64) -> StoreResult<()> {
        self.counters
            .insert(concept.get(), value)
            .map_err(redb_err("insert"))?;
        Ok(())
    }
}

impl GraphStore for DurableGraphStore {
    fn get_vertex(&self, id: ConceptId) -> StoreResult<Option<Vertex>> {
        self.read_vertex(id)
    }

    fn lookup(&self, property: &ConceptProperty) -> StoreResult<Vec<ConceptId>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let raw: Vec<u64> = match property {
            ConceptProperty::Id(id) => {
                let table = txn.open_table(VERTICES).map_err(redb_err("open_table"))?;
                let exists = table.get(id.get()).map_err(redb_err("get"))?.is_some();
                if exists { vec![id.get()] } else { vec![] }
            }
            ConceptProperty::Index(index) => {
                let table = txn
                    .open_multimap_table(RESOURCE_INDEX)
                    .map_err(redb_err("open_multimap_table"))?;
                let mut ids = Vec::new();
                for g in table.get(index.as_str()).map_err(redb_err("get"))? {
                    ids.push(g.map_err(redb_err("read"))?.value());
                }
                ids
            }
            ConceptProperty::TypeLabel(label) => {
                let table = txn.open_table(TYPE_LABELS).map_err(redb_err("open_table"))?;
                let found = table.get(label.as_str()).map_err(redb_err("get"))?;
                found.map(|g| g.value()).into_iter().collect()
            }
            ConceptProperty::TypeId(type_id) => {
                let table = txn.open_table(TYPE_IDS).map_err(redb_err("open_table"))?;
                let found = table.get(type_id.get()).map_err(redb_err("get"))?;
                found.map(|g| g.value()).into_iter().collect()
            }
        };
        let mut ids: Vec<ConceptId> = raw.into_iter().filter_map(ConceptId::new).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn edges(&self, id: ConceptId, direction: Direction) -> StoreResult<Vec<Edge>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let mut edge_ids = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            let table = txn
                .open_multimap_table(OUTGOING)
                .map_err(redb_err("open_multimap_table"))?;
            for g in table.get(id.get()).map_err(redb_err("get"))? {
                edge_ids.push(g.map_err(redb_err("read"))?.value());
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            let table = txn
                .open_multimap_table(INCOMING)
                .map_err(redb_err("open_multimap_table"))?;
            for g in table.get(id.get()).map_err(redb_err("get"))? {
                edge_ids.push(g.map_err(redb_err("read"))?.value());
            }
        }
        edge_ids.sort_unstable();
        edge_ids.dedup();

        let table = txn.open_table(EDGES).map_err(redb_err("open_table"))?;
        let mut edges = Vec::with_capacity(edge_ids.len());
        for edge_id in edge_ids {
            if let Some(g) = table.get(edge_id).map_err(redb_err("get"))? {
                edges.push(decode(g.value())?);
            }
        }
        Ok(edges)
    }

    fn counter(&self, concept: ConceptId) -> StoreResult<Option<i64>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(COUNTERS).map_err(redb_err("open_table"))?;
        let found = table.get(concept.get()).map_err(redb_err("get"))?;
        Ok(found.map(|g| g.value()))
    }

    fn type_vertices(&self) -> StoreResult<Vec<Vertex>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let type_ids = txn.open_table(TYPE_IDS).map_err(redb_err("open_table"))?;
        let vertices = txn.open_table(VERTICES).map_err(redb_err("open_table"))?;
        let mut types = Vec::new();
        for entry in type_ids.iter().map_err(redb_err("iter"))? {
            let (_, id) = entry.map_err(redb_err("read"))?;
            if let Some(g) = vertices.get(id.value()).map_err(redb_err("get"))? {
                types.push(decode::<Vertex>(g.value())?);
            }
        }
        types.sort_by_key(|v| v.id);
        Ok(types)
    }

    fn allocate_id(&self) -> StoreResult<u64> {
        self.ids.next_raw()
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut tables = open_all(&txn)?;
            // Dropping `txn` without commit aborts it, discarding partial writes.
            apply_batch(&mut tables, batch)?;
            tables
                .allocator
                .insert(NEXT_ID_KEY, self.ids.peek_next())
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))
    }

    fn clear(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        txn.delete_table(VERTICES).map_err(redb_err("delete_table"))?;
        txn.delete_table(EDGES).map_err(redb_err("delete_table"))?;
        txn.delete_multimap_table(OUTGOING)
            .map_err(redb_err("delete_multimap_table"))?;
        txn.delete_multimap_table(INCOMING)
            .map_err(redb_err("delete_multimap_table"))?;
        txn.delete_multimap_table(RESOURCE_INDEX)
            .map_err(redb_err("delete_multimap_table"))?;
        txn.delete_table(TYPE_LABELS).map_err(redb_err("delete_table"))?;
        txn.delete_table(TYPE_IDS).map_err(redb_err("delete_table"))?;
        txn.delete_table(COUNTERS).map_err(redb_err("delete_table"))?;
        {
            // Keep the allocator so ids of destroyed data are never reissued.
            let mut tables = open_all(&txn)?;
            tables
                .allocator
                .insert(NEXT_ID_KEY, self.ids.peek_next())
                .map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))
    }

    fn vertex_count(&self) -> StoreResult<usize> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(VERTICES).map_err(redb_err("open_table"))?;
        let len = table.len().map_err(redb_err("len"))?;
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BaseType, EdgeLabel, Mutation};
    use tempfile::TempDir;

    #[test]
    fn batch_round_trip_and_index_lookup() {
        let dir = TempDir::new().unwrap();
        let store = DurableGraphStore::open(dir.path()).unwrap();

        let index = ResourceIndex::from_raw("RESOURCE-8-a@example.com");
        let a = Vertex::new(store.allocate_concept_id().unwrap(), BaseType::Resource)
            .with(Property::Index(index.clone()));
        let b = Vertex::new(store.allocate_concept_id().unwrap(), BaseType::Relation);
        let edge = Edge::new(store.allocate_edge_id().unwrap(), EdgeLabel::RolePlayer, b.id, a.id);

        let mut batch = WriteBatch::new();
        batch
            .push(Mutation::PutVertex(a.clone()))
            .push(Mutation::PutVertex(b.clone()))
            .push(Mutation::PutEdge(edge.clone()));
        store.apply(batch).unwrap();

        assert_eq!(store.lookup(&ConceptProperty::Index(index)).unwrap(), vec![a.id]);
        assert_eq!(store.edges(a.id, Direction::Incoming).unwrap(), vec![edge]);
        assert_eq!(store.get_vertex(a.id).unwrap().unwrap().version, 2);
        assert_eq!(store.vertex_count().unwrap(), 2);
    }

    #[test]
    fn aborted_batch_is_invisible() {
        let dir = TempDir::new().unwrap();
        let store = DurableGraphStore::open(dir.path()).unwrap();
        let a = Vertex::new(store.allocate_concept_id().unwrap(), BaseType::Entity);

        let mut batch = WriteBatch::new();
        batch
            .push(Mutation::PutVertex(a.clone()))
            .push(Mutation::DeleteEdge(EdgeId::new(12_345)));
        assert!(store.apply(batch).is_err());
        assert!(store.get_vertex(a.id).unwrap().is_none());
    }

    #[test]
    fn counters_and_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let concept = ConceptId::new(5).unwrap();
        let last_id;
        {
            let store = DurableGraphStore::open(dir.path()).unwrap();
            let v = Vertex::new(store.allocate_concept_id().unwrap(), BaseType::Entity);
            last_id = v.id.get();
            let mut batch = WriteBatch::new();
            batch
                .push(Mutation::PutVertex(v))
                .push(Mutation::AddToCounter { concept, delta: 4 });
            store.apply(batch).unwrap();
        }

        let store = DurableGraphStore::open(dir.path()).unwrap();
        assert_eq!(store.counter(concept).unwrap(), Some(4));
        assert!(store.allocate_id().unwrap() > last_id);
    }

    #[test]
    fn clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = DurableGraphStore::open(dir.path()).unwrap();
        let v = Vertex::new(store.allocate_concept_id().unwrap(), BaseType::Entity);
        let mut batch = WriteBatch::new();
        batch
            .push(Mutation::PutVertex(v.clone()))
            .push(Mutation::AddToCounter {
                concept: v.id,
                delta: 1,
            });
        store.apply(batch).unwrap();

        store.clear().unwrap();
        assert_eq!(store.vertex_count().unwrap(), 0);
        assert_eq!(store.counter(v.id).unwrap(), None);
    }
}
