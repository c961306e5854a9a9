//! In-memory graph store.
//!
//! All records live behind one `RwLock`. A batch runs under the write lock and
//! records an undo entry for every raw write, so a failing batch is rolled
//! back before the lock is released. All data is lost on process exit.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::concept::{ConceptId, IdAllocator, ResourceIndex, TypeId, TypeLabel};
use crate::error::StoreError;

use super::batch::{BatchTarget, WriteBatch, apply_batch};
use super::{BaseType, ConceptProperty, Direction, Edge, EdgeId, GraphStore, Property, StoreResult, Vertex};

#[derive(Debug, Default)]
struct MemState {
    vertices: HashMap<ConceptId, Vertex>,
    edges: HashMap<EdgeId, Edge>,
    outgoing: HashMap<ConceptId, BTreeSet<EdgeId>>,
    incoming: HashMap<ConceptId, BTreeSet<EdgeId>>,
    index: HashMap<ResourceIndex, BTreeSet<ConceptId>>,
    labels: HashMap<TypeLabel, ConceptId>,
    type_ids: HashMap<TypeId, ConceptId>,
    counters: HashMap<ConceptId, i64>,
}

impl MemState {
    fn insert_edge(&mut self, edge: Edge) {
        self.outgoing.entry(edge.source).or_default().insert(edge.id);
        self.incoming.entry(edge.target).or_default().insert(edge.id);
        self.edges.insert(edge.id, edge);
    }

    fn drop_edge(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges.remove(&id) {
            if let Some(set) = self.outgoing.get_mut(&edge.source) {
                set.remove(&id);
            }
            if let Some(set) = self.incoming.get_mut(&edge.target) {
                set.remove(&id);
            }
        }
    }

    fn link(&mut self, id: ConceptId, property: &Property) {
        match property {
            Property::Index(index) => {
                self.index.entry(index.clone()).or_default().insert(id);
            }
            Property::Label(label) => {
                self.labels.insert(label.clone(), id);
            }
            Property::TypeId(type_id) => {
                self.type_ids.insert(*type_id, id);
            }
            _ => {}
        }
    }

    fn unlink(&mut self, id: ConceptId, property: &Property) {
        match property {
            Property::Index(index) => {
                if let Some(set) = self.index.get_mut(index) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.index.remove(index);
                    }
                }
            }
            Property::Label(label) => {
                if self.labels.get(label) == Some(&id) {
                    self.labels.remove(label);
                }
            }
            Property::TypeId(type_id) => {
                if self.type_ids.get(type_id) == Some(&id) {
                    self.type_ids.remove(type_id);
                }
            }
            _ => {}
        }
    }
}

/// Inverse of one raw write.
enum Undo {
    Vertex(ConceptId, Option<Vertex>),
    InsertedEdge(EdgeId),
    RemovedEdge(Edge),
    Linked(ConceptId, Property),
    Unlinked(ConceptId, Property),
    Counter(ConceptId, Option<i64>),
}

struct MemTxn<'a> {
    state: &'a mut MemState,
    undo: Vec<Undo>,
}

impl MemTxn<'_> {
    fn rollback(self) {
        let MemTxn { state, undo } = self;
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Vertex(id, Some(old)) => {
                    state.vertices.insert(id, old);
                }
                Undo::Vertex(id, None) => {
                    state.vertices.remove(&id);
                }
                Undo::InsertedEdge(id) => state.drop_edge(id),
                Undo::RemovedEdge(edge) => state.insert_edge(edge),
                Undo::Linked(id, property) => state.unlink(id, &property),
                Undo::Unlinked(id, property) => state.link(id, &property),
                Undo::Counter(id, Some(old)) => {
                    state.counters.insert(id, old);
                }
                Undo::Counter(id, None) => {
                    state.counters.remove(&id);
                }
            }
        }
    }
}

impl BatchTarget for MemTxn<'_> {
    fn vertex(&mut self, id: ConceptId) -> StoreResult<Option<Vertex>> {
        Ok(self.state.vertices.get(&id).cloned())
    }

    fn write_vertex(&mut self, vertex: &Vertex) -> StoreResult<()> {
        let old = self.state.vertices.insert(vertex.id, vertex.clone());
        self.undo.push(Undo::Vertex(vertex.id, old));
        Ok(())
    }

    fn remove_vertex(&mut self, id: ConceptId) -> StoreResult<()> {
        let old = self.state.vertices.remove(&id);
        self.state.outgoing.remove(&id);
        self.state.incoming.remove(&id);
        self.undo.push(Undo::Vertex(id, old));
        Ok(())
    }

    fn edge(&mut self, id: EdgeId) -> StoreResult<Option<Edge>> {
        Ok(self.state.edges.get(&id).cloned())
    }

    fn write_edge(&mut self, edge: &Edge) -> StoreResult<()> {
        self.state.insert_edge(edge.clone());
        self.undo.push(Undo::InsertedEdge(edge.id));
        Ok(())
    }

    fn remove_edge(&mut self, edge: &Edge) -> StoreResult<()> {
        self.state.drop_edge(edge.id);
        self.undo.push(Undo::RemovedEdge(edge.clone()));
        Ok(())
    }

    fn edge_ids(&mut self, id: ConceptId, direction: Direction) -> StoreResult<Vec<EdgeId>> {
        Ok(collect_edge_ids(self.state, id, direction))
    }

    fn index_members(&mut self, index: &ResourceIndex) -> StoreResult<Vec<ConceptId>> {
        Ok(self
            .state
            .index
            .get(index)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn label_owner(&mut self, label: &TypeLabel) -> StoreResult<Option<ConceptId>> {
        Ok(self.state.labels.get(label).copied())
    }

    fn type_id_owner(&mut self, type_id: TypeId) -> StoreResult<Option<ConceptId>> {
        Ok(self.state.type_ids.get(&type_id).copied())
    }

    fn link_property(&mut self, id: ConceptId, property: &Property) -> StoreResult<()> {
        self.state.link(id, property);
        self.undo.push(Undo::Linked(id, property.clone()));
        Ok(())
    }

    fn unlink_property(&mut self, id: ConceptId, property: &Property) -> StoreResult<()> {
        self.state.unlink(id, property);
        self.undo.push(Undo::Unlinked(id, property.clone()));
        Ok(())
    }

    fn counter(&mut self, concept: ConceptId) -> StoreResult<Option<i64>> {
        Ok(self.state.counters.get(&concept).copied())
    }

    fn write_counter(&mut self, concept: ConceptId, value: i64) -> StoreResult<()> {
        let old = self.state.counters.insert(concept, value);
        self.undo.push(Undo::Counter(concept, old));
        Ok(())
    }
}

fn collect_edge_ids(state: &MemState, id: ConceptId, direction: Direction) -> Vec<EdgeId> {
    let mut ids = Vec::new();
    if matches!(direction, Direction::Outgoing | Direction::Both) {
        if let Some(set) = state.outgoing.get(&id) {
            ids.extend(set.iter().copied());
        }
    }
    if matches!(direction, Direction::Incoming | Direction::Both) {
        if let Some(set) = state.incoming.get(&id) {
            ids.extend(set.iter().copied());
        }
    }
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Volatile [`GraphStore`] backed by hash maps.
#[derive(Debug)]
pub struct MemGraphStore {
    state: RwLock<MemState>,
    ids: IdAllocator,
}

impl MemGraphStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemState::default()),
            ids: IdAllocator::new(),
        }
    }

    /// Total number of stored edges.
    pub fn edge_count(&self) -> StoreResult<usize> {
        Ok(self.state.read().map_err(|_| StoreError::Poisoned)?.edges.len())
    }
}

impl Default for MemGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for MemGraphStore {
    fn get_vertex(&self, id: ConceptId) -> StoreResult<Option<Vertex>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.vertices.get(&id).cloned())
    }

    fn lookup(&self, property: &ConceptProperty) -> StoreResult<Vec<ConceptId>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let ids = match property {
            ConceptProperty::Id(id) => state
                .vertices
                .contains_key(id)
                .then_some(*id)
                .into_iter()
                .collect(),
            ConceptProperty::Index(index) => state
                .index
                .get(index)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            ConceptProperty::TypeLabel(label) => state.labels.get(label).copied().into_iter().collect(),
            ConceptProperty::TypeId(type_id) => {
                state.type_ids.get(type_id).copied().into_iter().collect()
            }
        };
        Ok(ids)
    }

    fn edges(&self, id: ConceptId, direction: Direction) -> StoreResult<Vec<Edge>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(collect_edge_ids(&state, id, direction)
            .into_iter()
            .filter_map(|edge_id| state.edges.get(&edge_id).cloned())
            .collect())
    }

    fn counter(&self, concept: ConceptId) -> StoreResult<Option<i64>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.counters.get(&concept).copied())
    }

    fn type_vertices(&self) -> StoreResult<Vec<Vertex>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let mut types: Vec<Vertex> = state
            .vertices
            .values()
            .filter(|v| v.base == BaseType::Type)
            .cloned()
            .collect();
        types.sort_by_key(|v| v.id);
        Ok(types)
    }

    fn allocate_id(&self) -> StoreResult<u64> {
        self.ids.next_raw()
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let mut txn = MemTxn {
            state: &mut *state,
            undo: Vec::new(),
        };
        match apply_batch(&mut txn, batch) {
            Ok(()) => Ok(()),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    fn clear(&self) -> StoreResult<()> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        *state = MemState::default();
        Ok(())
    }

    fn vertex_count(&self) -> StoreResult<usize> {
        Ok(self.state.read().map_err(|_| StoreError::Poisoned)?.vertices.len())
    }
}
