//! Type registry: label ↔ graph-local id mapping plus the root type handles.
//!
//! The registry is graph-scoped. It is rebuilt from the type vertices in the
//! store when a session opens and torn down with the session. The eight root
//! ("meta") types are resolved once at construction; their handles never
//! change afterwards and every accessor returns a clone of the same `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::concept::{ConceptId, DataType, TypeId, TypeLabel};
use crate::error::{GraphResult, StoreError, TypeError};
use crate::store::{BaseType, ConceptProperty, GraphStore, Vertex};

/// The closed set of root type kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetaKind {
    Concept,
    Relation,
    Role,
    Resource,
    Entity,
    Rule,
    InferenceRule,
    ConstraintRule,
}

impl MetaKind {
    pub const ALL: [MetaKind; 8] = [
        MetaKind::Concept,
        MetaKind::Relation,
        MetaKind::Role,
        MetaKind::Resource,
        MetaKind::Entity,
        MetaKind::Rule,
        MetaKind::InferenceRule,
        MetaKind::ConstraintRule,
    ];

    /// Type ids below this are reserved for the root types.
    pub const RESERVED_IDS: u32 = 8;

    pub fn label(self) -> &'static str {
        match self {
            MetaKind::Concept => "concept",
            MetaKind::Relation => "relation",
            MetaKind::Role => "role",
            MetaKind::Resource => "resource",
            MetaKind::Entity => "entity",
            MetaKind::Rule => "rule",
            MetaKind::InferenceRule => "inference-rule",
            MetaKind::ConstraintRule => "constraint-rule",
        }
    }

    /// Fixed type id of this root.
    pub fn type_id(self) -> TypeId {
        TypeId::new(self as u32)
    }

    pub fn from_type_id(type_id: TypeId) -> Option<MetaKind> {
        MetaKind::ALL.get(type_id.get() as usize).copied()
    }

    /// Root this root is itself a subtype of.
    pub fn super_kind(self) -> Option<MetaKind> {
        match self {
            MetaKind::Concept => None,
            MetaKind::InferenceRule | MetaKind::ConstraintRule => Some(MetaKind::Rule),
            _ => Some(MetaKind::Concept),
        }
    }

    /// Structural role of instances of types under this root, if instantiable.
    pub fn instance_base(self) -> Option<BaseType> {
        match self {
            MetaKind::Entity => Some(BaseType::Entity),
            MetaKind::Relation => Some(BaseType::Relation),
            MetaKind::Resource => Some(BaseType::Resource),
            MetaKind::Rule | MetaKind::InferenceRule | MetaKind::ConstraintRule => {
                Some(BaseType::Rule)
            }
            MetaKind::Concept | MetaKind::Role => None,
        }
    }
}

impl std::fmt::Display for MetaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable description of a type.
#[derive(Debug, PartialEq, Eq)]
pub struct TypeInfo {
    pub concept_id: ConceptId,
    pub label: TypeLabel,
    pub type_id: TypeId,
    /// Root kind the type descends from (the root itself for meta types).
    pub kind: MetaKind,
    pub data_type: Option<DataType>,
}

/// Shared handle to a type. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHandle(Arc<TypeInfo>);

impl TypeHandle {
    pub fn new(info: TypeInfo) -> Self {
        TypeHandle(Arc::new(info))
    }

    pub fn concept_id(&self) -> ConceptId {
        self.0.concept_id
    }

    pub fn label(&self) -> &TypeLabel {
        &self.0.label
    }

    pub fn type_id(&self) -> TypeId {
        self.0.type_id
    }

    pub fn kind(&self) -> MetaKind {
        self.0.kind
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.0.data_type
    }

    pub fn is_meta(&self) -> bool {
        self.0.type_id.get() < MetaKind::RESERVED_IDS
    }

    /// Whether both handles point at the same allocation.
    pub fn same_handle(&self, other: &TypeHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn from_vertex(vertex: &Vertex) -> Option<Self> {
        Some(TypeHandle::new(TypeInfo {
            concept_id: vertex.id,
            label: vertex.label()?.clone(),
            type_id: vertex.type_id()?,
            kind: vertex.kind()?,
            data_type: vertex.data_type(),
        }))
    }
}

/// Graph-scoped registry of type labels, ids and root handles.
pub struct TypeIdRegistry {
    meta: Vec<TypeHandle>,
    by_label: DashMap<TypeLabel, TypeHandle>,
    by_id: DashMap<TypeId, TypeHandle>,
    by_concept: DashMap<ConceptId, TypeHandle>,
    next_type_id: AtomicU32,
}

impl TypeIdRegistry {
    /// Rebuild the registry from the type vertices in `store`.
    ///
    /// The root types must already exist (see [`crate::schema::bootstrap_meta`]).
    pub fn restore(store: &dyn GraphStore) -> GraphResult<Self> {
        let by_label = DashMap::new();
        let by_id = DashMap::new();
        let by_concept = DashMap::new();
        let mut max_id = MetaKind::RESERVED_IDS - 1;

        for vertex in store.type_vertices()? {
            let Some(handle) = TypeHandle::from_vertex(&vertex) else {
                tracing::warn!(vertex = %vertex.id, "skipping type vertex without label or id");
                continue;
            };
            max_id = max_id.max(handle.type_id().get());
            by_id.insert(handle.type_id(), handle.clone());
            by_concept.insert(handle.concept_id(), handle.clone());
            by_label.insert(handle.label().clone(), handle);
        }

        let mut meta = Vec::with_capacity(MetaKind::ALL.len());
        for kind in MetaKind::ALL {
            let handle = by_id
                .get(&kind.type_id())
                .map(|h| h.value().clone())
                .ok_or(StoreError::NotFound {
                    what: "meta type",
                    id: u64::from(kind.type_id().get()),
                })?;
            meta.push(handle);
        }

        tracing::debug!(types = by_id.len(), "restored type registry");
        Ok(Self {
            meta,
            by_label,
            by_id,
            by_concept,
            next_type_id: AtomicU32::new(max_id.saturating_add(1)),
        })
    }

    /// Map a label to this graph's id for it.
    ///
    /// Never allocates: an unknown label is an error.
    pub fn convert_to_id(&self, label: &TypeLabel) -> Result<TypeId, TypeError> {
        self.by_label
            .get(label)
            .map(|h| h.value().type_id())
            .ok_or_else(|| TypeError::LabelNotFound {
                label: label.to_string(),
            })
    }

    pub fn get(&self, label: &TypeLabel) -> Option<TypeHandle> {
        self.by_label.get(label).map(|h| h.value().clone())
    }

    pub fn get_by_id(&self, type_id: TypeId) -> Option<TypeHandle> {
        self.by_id.get(&type_id).map(|h| h.value().clone())
    }

    pub fn get_by_concept(&self, concept: ConceptId) -> Option<TypeHandle> {
        self.by_concept.get(&concept).map(|h| h.value().clone())
    }

    /// Handle of a root type.
    pub fn meta(&self, kind: MetaKind) -> &TypeHandle {
        &self.meta[kind as usize]
    }

    pub fn meta_concept(&self) -> &TypeHandle {
        self.meta(MetaKind::Concept)
    }

    pub fn meta_relation_type(&self) -> &TypeHandle {
        self.meta(MetaKind::Relation)
    }

    pub fn meta_role_type(&self) -> &TypeHandle {
        self.meta(MetaKind::Role)
    }

    pub fn meta_resource_type(&self) -> &TypeHandle {
        self.meta(MetaKind::Resource)
    }

    pub fn meta_entity_type(&self) -> &TypeHandle {
        self.meta(MetaKind::Entity)
    }

    pub fn meta_rule_type(&self) -> &TypeHandle {
        self.meta(MetaKind::Rule)
    }

    pub fn meta_rule_inference(&self) -> &TypeHandle {
        self.meta(MetaKind::InferenceRule)
    }

    pub fn meta_rule_constraint(&self) -> &TypeHandle {
        self.meta(MetaKind::ConstraintRule)
    }

    /// Reserve the id for a type about to be created.
    ///
    /// Skips ids another session sharing `store` has already committed. Two
    /// sessions that pick the same id before either commits are caught by the
    /// `TypeVacant` precondition of the creating batch.
    pub fn allocate_type_id(&self, store: &dyn GraphStore) -> GraphResult<TypeId> {
        loop {
            let raw = self.next_type_id.fetch_add(1, Ordering::Relaxed);
            if raw == u32::MAX {
                return Err(TypeError::IdsExhausted.into());
            }
            let type_id = TypeId::new(raw);
            if store.lookup(&ConceptProperty::TypeId(type_id))?.is_empty() {
                return Ok(type_id);
            }
            tracing::debug!(type_id = raw, "type id taken by another session, skipping");
        }
    }

    /// Record a type whose creating commit succeeded.
    pub fn register(&self, handle: TypeHandle) -> Result<(), TypeError> {
        if let Some(existing) = self.by_label.get(handle.label()) {
            return Err(TypeError::DuplicateLabel {
                label: handle.label().to_string(),
                existing_id: existing.value().type_id().get(),
            });
        }
        self.by_id.insert(handle.type_id(), handle.clone());
        self.by_concept.insert(handle.concept_id(), handle.clone());
        self.by_label.insert(handle.label().clone(), handle);
        Ok(())
    }

    /// All registered types, ordered by type id.
    pub fn all(&self) -> Vec<TypeHandle> {
        let mut all: Vec<TypeHandle> = self.by_id.iter().map(|h| h.value().clone()).collect();
        all.sort_by_key(|h| h.type_id());
        all
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl std::fmt::Debug for TypeIdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeIdRegistry")
            .field("types", &self.by_id.len())
            .field("next_type_id", &self.next_type_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use crate::store::MemGraphStore;

    fn registry() -> TypeIdRegistry {
        let store = MemGraphStore::new();
        schema::bootstrap_meta(&store).unwrap();
        TypeIdRegistry::restore(&store).unwrap()
    }

    #[test]
    fn allocation_skips_ids_committed_elsewhere() {
        let store = MemGraphStore::new();
        schema::bootstrap_meta(&store).unwrap();
        let ours = TypeIdRegistry::restore(&store).unwrap();
        let theirs = TypeIdRegistry::restore(&store).unwrap();

        let taken = theirs.allocate_type_id(&store).unwrap();
        let mut batch = crate::store::WriteBatch::new();
        schema::push_type(
            &store,
            &mut batch,
            schema::TypeSpec {
                label: "email".into(),
                type_id: taken,
                kind: MetaKind::Resource,
                data_type: Some(DataType::String),
                super_type: Some(theirs.meta_resource_type().concept_id()),
            },
        )
        .unwrap();
        store.apply(batch).unwrap();

        let next = ours.allocate_type_id(&store).unwrap();
        assert_eq!(taken.get(), MetaKind::RESERVED_IDS);
        assert_eq!(next.get(), MetaKind::RESERVED_IDS + 1);
    }

    #[test]
    fn meta_handles_are_singletons() {
        let registry = registry();
        let a = registry.meta_resource_type().clone();
        let b = registry.meta_resource_type().clone();
        assert!(a.same_handle(&b));
        assert_eq!(a.label().as_str(), "resource");
        assert_eq!(a.type_id(), MetaKind::Resource.type_id());
        assert!(a.is_meta());
        assert_eq!(registry.meta_rule_inference().label().as_str(), "inference-rule");
        assert_eq!(registry.meta_rule_constraint().kind(), MetaKind::ConstraintRule);
    }

    #[test]
    fn convert_to_id_never_allocates() {
        let registry = registry();
        let before = registry.len();
        let err = registry.convert_to_id(&"email".into()).unwrap_err();
        assert!(matches!(err, TypeError::LabelNotFound { .. }));
        assert_eq!(registry.len(), before);

        assert_eq!(
            registry.convert_to_id(&"entity".into()).unwrap(),
            MetaKind::Entity.type_id()
        );
    }

    #[test]
    fn register_rejects_duplicate_labels() {
        let registry = registry();
        let store = MemGraphStore::new();
        let type_id = registry.allocate_type_id(&store).unwrap();
        assert_eq!(type_id.get(), MetaKind::RESERVED_IDS);

        let handle = TypeHandle::new(TypeInfo {
            concept_id: ConceptId::new(500).unwrap(),
            label: "email".into(),
            type_id,
            kind: MetaKind::Resource,
            data_type: Some(DataType::String),
        });
        registry.register(handle.clone()).unwrap();
        assert_eq!(registry.convert_to_id(&"email".into()).unwrap(), type_id);
        assert_eq!(registry.get_by_concept(handle.concept_id()), Some(handle.clone()));

        let err = registry.register(handle).unwrap_err();
        assert!(matches!(err, TypeError::DuplicateLabel { .. }));
    }

    #[test]
    fn root_hierarchy_is_fixed() {
        assert_eq!(MetaKind::Concept.super_kind(), None);
        assert_eq!(MetaKind::Entity.super_kind(), Some(MetaKind::Concept));
        assert_eq!(MetaKind::InferenceRule.super_kind(), Some(MetaKind::Rule));
        assert_eq!(MetaKind::from_type_id(TypeId::new(7)), Some(MetaKind::ConstraintRule));
        assert_eq!(MetaKind::from_type_id(TypeId::new(8)), None);
        assert_eq!(MetaKind::Role.instance_base(), None);
    }
}
