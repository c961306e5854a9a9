//! Transaction-scoped graph handles.
//!
//! A [`Graph`] buffers writes in a [`WriteBatch`] until [`Graph::commit`].
//! Reads go to the committed store, except that concepts created in this
//! transaction are visible to it. Dropping a handle without committing rolls
//! it back.
//!
//! The repair entry points (`duplicate_resources_exist`,
//! `fix_duplicate_resources`, `update_concept_counts`, `shard`) are not part
//! of the transaction: each is applied to the store as its own atomic unit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::commit::{CommitCoordinator, CommitMode};
use crate::commit_log::CommitLog;
use crate::concept::{ConceptId, DataType, ResourceIndex, ResourceValue, TypeId, TypeLabel};
use crate::error::{CommitError, GraphResult, StoreError, TypeError};
use crate::registry::{MetaKind, TypeHandle};
use crate::schema::{self, TypeSpec};
use crate::session::Session;
use crate::store::{
    BaseType, ConceptProperty, Edge, EdgeLabel, Mutation, Property, Vertex, WriteBatch,
};

/// Writes buffered by one graph handle.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub batch: WriteBatch,
    /// Concepts created in this transaction.
    pub created: HashMap<ConceptId, Vertex>,
    /// Resources created in this transaction, by index.
    pub resources: BTreeMap<ResourceIndex, BTreeSet<ConceptId>>,
    /// Signed instance count change per type vertex.
    pub counts: BTreeMap<ConceptId, i64>,
    /// Types created in this transaction with their first shard.
    pub types: Vec<(TypeHandle, ConceptId)>,
    /// Edges added per instance vertex.
    pub added_degree: HashMap<ConceptId, usize>,
    pub deleted: BTreeSet<ConceptId>,
}

impl Transaction {
    fn pending_type(&self, label: &TypeLabel) -> Option<&(TypeHandle, ConceptId)> {
        self.types.iter().find(|(h, _)| h.label() == label)
    }

    fn count(&mut self, type_vertex: ConceptId, delta: i64) {
        let entry = self.counts.entry(type_vertex).or_default();
        *entry += delta;
        if *entry == 0 {
            self.counts.remove(&type_vertex);
        }
    }

    fn add_degree(&mut self, id: ConceptId) {
        *self.added_degree.entry(id).or_default() += 1;
    }
}

/// A transaction against a session's graph.
pub struct Graph {
    session: Session,
    tx: Option<Transaction>,
}

impl Graph {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session,
            tx: Some(Transaction::default()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether commits skip inline checks and defer them to the repair pass.
    pub fn is_batch_graph(&self) -> bool {
        self.session.is_batch()
    }

    // -----------------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------------

    pub fn meta_concept(&self) -> &TypeHandle {
        self.session.registry().meta_concept()
    }

    pub fn meta_relation_type(&self) -> &TypeHandle {
        self.session.registry().meta_relation_type()
    }

    pub fn meta_role_type(&self) -> &TypeHandle {
        self.session.registry().meta_role_type()
    }

    pub fn meta_resource_type(&self) -> &TypeHandle {
        self.session.registry().meta_resource_type()
    }

    pub fn meta_entity_type(&self) -> &TypeHandle {
        self.session.registry().meta_entity_type()
    }

    pub fn meta_rule_type(&self) -> &TypeHandle {
        self.session.registry().meta_rule_type()
    }

    pub fn meta_rule_inference(&self) -> &TypeHandle {
        self.session.registry().meta_rule_inference()
    }

    pub fn meta_rule_constraint(&self) -> &TypeHandle {
        self.session.registry().meta_rule_constraint()
    }

    /// This graph's id for `label`, including types created in this transaction.
    pub fn convert_to_id(&self, label: &TypeLabel) -> GraphResult<TypeId> {
        Ok(self.resolve_type(label)?.type_id())
    }

    pub fn get_type(&self, label: &TypeLabel) -> Option<TypeHandle> {
        self.resolve_type(label).ok()
    }

    pub fn put_entity_type(&mut self, label: impl Into<TypeLabel>) -> GraphResult<TypeHandle> {
        self.put_type(label.into(), MetaKind::Entity, None)
    }

    pub fn put_relation_type(&mut self, label: impl Into<TypeLabel>) -> GraphResult<TypeHandle> {
        self.put_type(label.into(), MetaKind::Relation, None)
    }

    pub fn put_role_type(&mut self, label: impl Into<TypeLabel>) -> GraphResult<TypeHandle> {
        self.put_type(label.into(), MetaKind::Role, None)
    }

    pub fn put_resource_type(
        &mut self,
        label: impl Into<TypeLabel>,
        data_type: DataType,
    ) -> GraphResult<TypeHandle> {
        self.put_type(label.into(), MetaKind::Resource, Some(data_type))
    }

    /// Declare that `relation_type` relates `role`.
    pub fn relates(&mut self, relation_type: &TypeLabel, role: &TypeLabel) -> GraphResult<()> {
        self.schema_edge(EdgeLabel::Relates, relation_type, MetaKind::Relation, role)
    }

    /// Declare that instances of `player_type` may play `role`.
    pub fn plays(&mut self, player_type: &TypeLabel, role: &TypeLabel) -> GraphResult<()> {
        let player = self.resolve_type(player_type)?;
        self.schema_edge(EdgeLabel::Plays, player_type, player.kind(), role)
    }

    fn put_type(
        &mut self,
        label: TypeLabel,
        kind: MetaKind,
        data_type: Option<DataType>,
    ) -> GraphResult<TypeHandle> {
        self.tx()?;
        if let Ok(existing) = self.resolve_type(&label) {
            if existing.is_meta() {
                return Err(TypeError::MetaImmutable {
                    label: label.to_string(),
                }
                .into());
            }
            if existing.kind() != kind || existing.data_type() != data_type {
                return Err(wrong_kind(&existing, kind).into());
            }
            return Ok(existing);
        }

        let registry = self.session.registry();
        let spec = TypeSpec {
            label,
            type_id: registry.allocate_type_id(self.session.store().as_ref())?,
            kind,
            data_type,
            super_type: Some(registry.meta(kind).concept_id()),
        };
        let store = self.session.store().clone();
        let tx = self.tx()?;
        let (handle, shard) = schema::push_type(store.as_ref(), &mut tx.batch, spec)?;
        tx.types.push((handle.clone(), shard));
        tracing::debug!(label = %handle.label(), type_id = %handle.type_id(), kind = %kind, "created type");
        Ok(handle)
    }

    fn schema_edge(
        &mut self,
        label: EdgeLabel,
        source_type: &TypeLabel,
        source_kind: MetaKind,
        role: &TypeLabel,
    ) -> GraphResult<()> {
        let source = self.typed(source_type, source_kind)?;
        let role = self.typed(role, MetaKind::Role)?;
        let edge = Edge::new(
            self.session.store().allocate_edge_id()?,
            label,
            source.concept_id(),
            role.concept_id(),
        );
        self.tx()?.batch.push(Mutation::PutEdge(edge));
        Ok(())
    }

    fn resolve_type(&self, label: &TypeLabel) -> GraphResult<TypeHandle> {
        if let Some((handle, _)) = self.tx.as_ref().and_then(|tx| tx.pending_type(label)) {
            return Ok(handle.clone());
        }
        self.session.registry().get(label).ok_or_else(|| {
            TypeError::LabelNotFound {
                label: label.to_string(),
            }
            .into()
        })
    }

    /// Resolve a user type of the given kind.
    fn typed(&self, label: &TypeLabel, kind: MetaKind) -> GraphResult<TypeHandle> {
        let handle = self.resolve_type(label)?;
        if handle.kind() != kind {
            return Err(wrong_kind(&handle, kind).into());
        }
        if handle.is_meta() {
            return Err(TypeError::MetaImmutable {
                label: label.to_string(),
            }
            .into());
        }
        Ok(handle)
    }

    fn current_shard(&self, handle: &TypeHandle) -> GraphResult<ConceptId> {
        if let Some((_, shard)) = self.tx.as_ref().and_then(|tx| tx.pending_type(handle.label())) {
            return Ok(*shard);
        }
        self.session
            .store()
            .get_vertex(handle.concept_id())?
            .and_then(|v| v.current_shard())
            .ok_or_else(|| {
                StoreError::NotFound {
                    what: "type shard",
                    id: handle.concept_id().get(),
                }
                .into()
            })
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub fn add_entity(&mut self, entity_type: &TypeLabel) -> GraphResult<ConceptId> {
        let handle = self.typed(entity_type, MetaKind::Entity)?;
        self.add_instance(&handle, BaseType::Entity, Vec::new())
    }

    /// Create (or, outside batch mode, reuse) the resource for `value`.
    ///
    /// In batch mode a new vertex is created every time and duplicates are
    /// left to the repair pass.
    pub fn put_resource(
        &mut self,
        resource_type: &TypeLabel,
        value: impl Into<ResourceValue>,
    ) -> GraphResult<ConceptId> {
        let value = value.into();
        let handle = self.typed(resource_type, MetaKind::Resource)?;
        if let Some(expected) = handle.data_type() {
            if value.data_type() != expected {
                return Err(TypeError::DataTypeMismatch {
                    label: resource_type.to_string(),
                    data_type: expected.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
        }
        let index = ResourceIndex::of(handle.type_id(), &value);

        if !self.is_batch_graph() {
            if let Some(existing) = self.existing_resource(&index)? {
                return Ok(existing);
            }
        }

        let id = self.add_instance(
            &handle,
            BaseType::Resource,
            vec![Property::Index(index.clone()), Property::Value(value)],
        )?;
        self.tx()?.resources.entry(index).or_default().insert(id);
        Ok(id)
    }

    fn existing_resource(&self, index: &ResourceIndex) -> GraphResult<Option<ConceptId>> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(CommitError::Finished.into());
        };
        if let Some(id) = tx
            .resources
            .get(index)
            .and_then(|ids| ids.iter().find(|id| !tx.deleted.contains(*id)))
        {
            return Ok(Some(*id));
        }
        let held = self
            .session
            .store()
            .lookup(&ConceptProperty::Index(index.clone()))?;
        Ok(held.into_iter().find(|id| !tx.deleted.contains(id)))
    }

    /// Create a relation with the given (role, player) pairs.
    pub fn add_relation(
        &mut self,
        relation_type: &TypeLabel,
        role_players: &[(TypeLabel, ConceptId)],
    ) -> GraphResult<ConceptId> {
        let handle = self.typed(relation_type, MetaKind::Relation)?;
        let mut roles = Vec::with_capacity(role_players.len());
        for (role, player) in role_players {
            let role = self.typed(role, MetaKind::Role)?;
            roles.push((role.type_id(), *player));
        }

        let relation = self.add_instance(&handle, BaseType::Relation, Vec::new())?;
        let store = self.session.store().clone();
        let tx = self.tx()?;
        for (role, player) in roles {
            if !tx.created.contains_key(&player) {
                tx.batch.expect_exists(player);
            }
            let edge = Edge::new(store.allocate_edge_id()?, EdgeLabel::RolePlayer, relation, player)
                .with_role(role);
            tx.batch.push(Mutation::PutEdge(edge));
            tx.add_degree(relation);
            tx.add_degree(player);
        }
        Ok(relation)
    }

    fn add_instance(
        &mut self,
        handle: &TypeHandle,
        base: BaseType,
        properties: Vec<Property>,
    ) -> GraphResult<ConceptId> {
        let shard = self.current_shard(handle)?;
        let store = self.session.store().clone();
        let id = store.allocate_concept_id()?;
        let mut vertex = Vertex::new(id, base).with(Property::InstanceOf(handle.concept_id()));
        for property in properties {
            vertex = vertex.with(property);
        }

        let tx = self.tx()?;
        tx.batch.push(Mutation::PutVertex(vertex.clone()));
        tx.batch.push(Mutation::PutEdge(Edge::new(
            store.allocate_edge_id()?,
            EdgeLabel::Isa,
            id,
            shard,
        )));
        tx.created.insert(id, vertex);
        tx.count(handle.concept_id(), 1);
        tx.add_degree(id);
        Ok(id)
    }

    /// Delete an instance together with its edges.
    pub fn delete_concept(&mut self, id: ConceptId) -> GraphResult<()> {
        let created = self.tx()?.created.get(&id).cloned();
        let vertex = match created {
            Some(v) => v,
            None => self.session.store().get_vertex(id)?.ok_or(StoreError::NotFound {
                what: "concept",
                id: id.get(),
            })?,
        };
        let Some(type_vertex) = vertex.instance_of() else {
            return Err(TypeError::WrongKind {
                label: id.to_string(),
                expected: "instance".into(),
                actual: vertex.base.to_string(),
            }
            .into());
        };

        let tx = self.tx()?;
        if !tx.deleted.insert(id) {
            return Ok(());
        }
        if !tx.created.contains_key(&id) {
            tx.batch.expect_exists(id);
        }
        tx.batch.push(Mutation::DeleteVertex(id));
        tx.count(type_vertex, -1);
        if let Some(index) = vertex.index() {
            if let Some(ids) = tx.resources.get_mut(index) {
                ids.remove(&id);
                if ids.is_empty() {
                    tx.resources.remove(index);
                }
            }
        }
        tx.added_degree.remove(&id);
        Ok(())
    }

    /// Look a concept up by a typed property.
    ///
    /// An index held by several resources (possible in batch mode) yields the
    /// lowest id.
    pub fn get_concept(&self, property: &ConceptProperty) -> GraphResult<Option<Vertex>> {
        if let (ConceptProperty::Id(id), Some(tx)) = (property, self.tx.as_ref()) {
            if tx.deleted.contains(id) {
                return Ok(None);
            }
            if let Some(v) = tx.created.get(id) {
                return Ok(Some(v.clone()));
            }
        }
        let store = self.session.store();
        match store.lookup(property)?.first() {
            Some(id) => Ok(store.get_vertex(*id)?),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Commit the transaction.
    ///
    /// In batch mode the inline checks are skipped and the commit log is
    /// always forwarded to the session's sink. Otherwise the transaction is
    /// validated inline and a log is forwarded only if it carries count
    /// changes.
    ///
    /// The writes are stored before the log is forwarded. If the sink then
    /// fails, the error is [`CommitError::LogUndelivered`] carrying the log.
    pub fn commit(mut self) -> GraphResult<()> {
        let batch = self.is_batch_graph();
        let mode = if batch {
            CommitMode::Deferred
        } else {
            CommitMode::Validated
        };
        let log = self.finish(mode)?;
        if batch || !log.concept_counts.is_empty() {
            if let Err(e) = self.session.sink().submit(log.clone()) {
                tracing::error!(keyspace = %log.keyspace, error = %e, "commit log not delivered");
                return Err(CommitError::LogUndelivered {
                    log: Box::new(log),
                    source: Box::new(e),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Commit with inline validation and hand the log back instead of
    /// forwarding it. `None` if there is no deferred work.
    pub fn commit_no_logs(mut self) -> GraphResult<Option<CommitLog>> {
        let log = self.finish(CommitMode::Validated)?;
        Ok((!log.is_empty()).then_some(log))
    }

    /// Discard every buffered write.
    pub fn rollback(mut self) {
        if let Some(tx) = self.take() {
            tracing::debug!(writes = tx.batch.len(), "rolled back transaction");
        }
    }

    fn finish(&mut self, mode: CommitMode) -> GraphResult<CommitLog> {
        let tx = self.take().ok_or(CommitError::Finished)?;
        self.session.ensure_open()?;
        CommitCoordinator::new(&self.session).commit(tx, mode)
    }

    fn take(&mut self) -> Option<Transaction> {
        let tx = self.tx.take();
        if tx.is_some() {
            self.session.transaction_finished();
        }
        tx
    }

    fn tx(&mut self) -> GraphResult<&mut Transaction> {
        self.session.ensure_open()?;
        self.tx.as_mut().ok_or_else(|| CommitError::Finished.into())
    }

    // -----------------------------------------------------------------------
    // Session and repair
    // -----------------------------------------------------------------------

    /// Close the session this graph belongs to, rolling this graph back.
    pub fn close_session(mut self) -> GraphResult<()> {
        self.take();
        self.session.close()
    }

    /// Destroy the graph's data. Must not race with other open transactions.
    pub fn delete(mut self) -> GraphResult<()> {
        self.take();
        self.session.delete()
    }

    pub fn duplicate_resources_exist(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> GraphResult<bool> {
        self.session.ensure_open()?;
        Ok(self.session.resolver().duplicate_resources_exist(index, candidates)?)
    }

    pub fn fix_duplicate_resources(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> GraphResult<bool> {
        self.session.ensure_open()?;
        self.session.resolver().fix_duplicate_resources(index, candidates)
    }

    /// Apply count deltas; returns the concepts now due a shard.
    pub fn update_concept_counts(
        &self,
        deltas: &BTreeMap<ConceptId, i64>,
    ) -> GraphResult<Vec<ConceptId>> {
        self.session.ensure_open()?;
        self.session.sharding().update_concept_counts(deltas)
    }

    pub fn shard(&self, concept: ConceptId) -> GraphResult<bool> {
        self.session.ensure_open()?;
        self.session.sharding().shard(concept)
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Some(tx) = self.take() {
            if !tx.batch.is_empty() {
                tracing::debug!(writes = tx.batch.len(), "graph dropped without commit, rolled back");
            }
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("keyspace", &self.session.keyspace())
            .field("batch", &self.is_batch_graph())
            .field("pending_writes", &self.tx.as_ref().map(|tx| tx.batch.len()))
            .finish()
    }
}

fn wrong_kind(handle: &TypeHandle, expected: MetaKind) -> TypeError {
    TypeError::WrongKind {
        label: handle.label().to_string(),
        expected: expected.to_string(),
        actual: handle.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::commit_log::DiscardSink;
    use crate::config::GraphConfig;
    use crate::error::GraphError;

    fn session(batch: bool) -> Session {
        Session::open(
            GraphConfig::in_memory("test").with_batch(batch),
            Arc::new(DiscardSink),
        )
        .unwrap()
    }

    #[test]
    fn types_get_ids_from_eight_up() {
        let session = session(false);
        let mut graph = session.graph().unwrap();
        let person = graph.put_entity_type("person").unwrap();
        let email = graph.put_resource_type("email", DataType::String).unwrap();
        assert_eq!(person.type_id().get(), 8);
        assert_eq!(email.type_id().get(), 9);
        assert_eq!(graph.convert_to_id(&"email".into()).unwrap(), email.type_id());
        graph.commit().unwrap();

        let graph = session.graph().unwrap();
        assert_eq!(graph.convert_to_id(&"person".into()).unwrap().get(), 8);
    }

    #[test]
    fn redefining_with_another_kind_fails() {
        let session = session(false);
        let mut graph = session.graph().unwrap();
        graph.put_entity_type("person").unwrap();
        let err = graph.put_relation_type("person").unwrap_err();
        assert!(matches!(err, GraphError::Type(TypeError::WrongKind { .. })));
        let err = graph.put_entity_type("entity").unwrap_err();
        assert!(matches!(err, GraphError::Type(TypeError::MetaImmutable { .. })));
    }

    #[test]
    fn normal_mode_reuses_resources() {
        let session = session(false);
        let mut graph = session.graph().unwrap();
        graph.put_resource_type("email", DataType::String).unwrap();
        let a = graph.put_resource(&"email".into(), "a@example.com").unwrap();
        let b = graph.put_resource(&"email".into(), "a@example.com").unwrap();
        assert_eq!(a, b);
        graph.commit().unwrap();

        let mut graph = session.graph().unwrap();
        let c = graph.put_resource(&"email".into(), "a@example.com").unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn batch_mode_always_creates() {
        let session = session(true);
        let mut graph = session.graph().unwrap();
        assert!(graph.is_batch_graph());
        graph.put_resource_type("email", DataType::String).unwrap();
        let a = graph.put_resource(&"email".into(), "a@example.com").unwrap();
        let b = graph.put_resource(&"email".into(), "a@example.com").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn data_type_is_enforced() {
        let session = session(false);
        let mut graph = session.graph().unwrap();
        graph.put_resource_type("age", DataType::Long).unwrap();
        let err = graph.put_resource(&"age".into(), "old").unwrap_err();
        assert!(matches!(err, GraphError::Type(TypeError::DataTypeMismatch { .. })));
    }

    #[test]
    fn dropped_graph_rolls_back() {
        let session = session(false);
        {
            let mut graph = session.graph().unwrap();
            graph.put_entity_type("person").unwrap();
        }
        assert!(session.registry().get(&"person".into()).is_none());
        assert_eq!(session.pending_transactions(), 0);
    }

    #[test]
    fn created_concepts_are_visible_before_commit() {
        let session = session(false);
        let mut graph = session.graph().unwrap();
        graph.put_entity_type("person").unwrap();
        let alice = graph.add_entity(&"person".into()).unwrap();
        let seen = graph.get_concept(&ConceptProperty::Id(alice)).unwrap().unwrap();
        assert_eq!(seen.base, BaseType::Entity);

        graph.delete_concept(alice).unwrap();
        assert!(graph.get_concept(&ConceptProperty::Id(alice)).unwrap().is_none());
    }

    #[test]
    fn writes_after_close_are_rejected() {
        let session = session(false);
        let mut graph = session.graph().unwrap();
        session.close().unwrap();
        let err = graph.put_entity_type("person").unwrap_err();
        assert!(matches!(err, GraphError::Session(_)));
        let err = graph.commit().unwrap_err();
        assert!(matches!(err, GraphError::Session(_)));
    }
}
