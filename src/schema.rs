//! Type vertex construction.
//!
//! A type is written as a type vertex plus its first shard: a shard vertex
//! owned by the type, linked shard → type, and recorded as the type's
//! `CurrentShard`. New instances always attach to the current shard.

use crate::concept::{ConceptId, DataType, TypeId, TypeLabel};
use crate::error::StoreError;
use crate::registry::{MetaKind, TypeHandle, TypeInfo};
use crate::store::{
    BaseType, ConceptProperty, Edge, EdgeLabel, GraphStore, Mutation, Property, StoreResult,
    Vertex, WriteBatch,
};

/// What to create.
#[derive(Debug, Clone)]
pub(crate) struct TypeSpec {
    pub label: TypeLabel,
    pub type_id: TypeId,
    pub kind: MetaKind,
    pub data_type: Option<DataType>,
    /// Supertype vertex; `None` only for the root concept.
    pub super_type: Option<ConceptId>,
}

/// Append the writes creating a type and its first shard to `batch`.
///
/// Returns the new type's handle and the id of its first shard.
pub(crate) fn push_type(
    store: &dyn GraphStore,
    batch: &mut WriteBatch,
    spec: TypeSpec,
) -> StoreResult<(TypeHandle, ConceptId)> {
    let type_vertex = store.allocate_concept_id()?;
    let shard = store.allocate_concept_id()?;

    let mut vertex = Vertex::new(type_vertex, BaseType::Type)
        .with(Property::Label(spec.label.clone()))
        .with(Property::TypeId(spec.type_id))
        .with(Property::Kind(spec.kind))
        .with(Property::CurrentShard(shard))
        .with(Property::ShardGeneration(0));
    if let Some(data_type) = spec.data_type {
        vertex = vertex.with(Property::DataType(data_type));
    }
    batch.expect_type_vacant(spec.label.clone(), spec.type_id);
    batch.push(Mutation::PutVertex(vertex));
    batch.push(Mutation::PutVertex(
        Vertex::new(shard, BaseType::Shard).with(Property::ShardOwner(type_vertex)),
    ));
    batch.push(Mutation::PutEdge(Edge::new(
        store.allocate_edge_id()?,
        EdgeLabel::Shard,
        shard,
        type_vertex,
    )));
    if let Some(super_type) = spec.super_type {
        batch.push(Mutation::PutEdge(Edge::new(
            store.allocate_edge_id()?,
            EdgeLabel::Sub,
            type_vertex,
            super_type,
        )));
    }

    let handle = TypeHandle::new(TypeInfo {
        concept_id: type_vertex,
        label: spec.label,
        type_id: spec.type_id,
        kind: spec.kind,
        data_type: spec.data_type,
    });
    Ok((handle, shard))
}

/// Create the eight root types if the store has none yet.
///
/// Returns `true` if they were written by this call.
pub fn bootstrap_meta(store: &dyn GraphStore) -> StoreResult<bool> {
    let root = ConceptProperty::TypeId(MetaKind::Concept.type_id());
    if !store.lookup(&root)?.is_empty() {
        return Ok(false);
    }

    let mut batch = WriteBatch::new();
    let mut created: Vec<(MetaKind, ConceptId)> = Vec::with_capacity(MetaKind::ALL.len());
    for kind in MetaKind::ALL {
        let super_type = kind
            .super_kind()
            .and_then(|s| created.iter().find(|(k, _)| *k == s).map(|(_, id)| *id));
        let (handle, _) = push_type(
            store,
            &mut batch,
            TypeSpec {
                label: TypeLabel::new(kind.label()),
                type_id: kind.type_id(),
                kind,
                data_type: None,
                super_type,
            },
        )?;
        created.push((kind, handle.concept_id()));
    }
    match store.apply(batch) {
        Ok(()) => {}
        Err(StoreError::TypeTaken { .. }) => {
            tracing::debug!("meta types bootstrapped concurrently by another session");
            return Ok(false);
        }
        Err(e) => return Err(e),
    }
    tracing::info!(types = created.len(), "bootstrapped meta types");
    Ok(true)
}
