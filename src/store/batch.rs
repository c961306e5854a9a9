//! Atomic write batches.
//!
//! A [`WriteBatch`] is checked and applied by [`apply_batch`] against a
//! backend-specific [`BatchTarget`]. The backend supplies raw record access
//! inside its own transaction; this module owns the semantics that must be
//! identical across backends: precondition checks, version bumps, secondary
//! index maintenance, cascading deletes and signed counter arithmetic.

use crate::concept::{ConceptId, ResourceIndex, TypeId, TypeLabel};
use crate::error::StoreError;

use super::{Direction, Edge, EdgeId, Property, StoreResult, Vertex};

/// Optimistic guard evaluated before any mutation is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// The vertex exists and still has this version.
    VertexVersion { id: ConceptId, version: u64 },
    /// The vertex exists.
    VertexExists(ConceptId),
    /// No live vertex currently carries this index.
    IndexVacant(ResourceIndex),
    /// Neither the label nor the type id belongs to a type yet.
    TypeVacant { label: TypeLabel, type_id: TypeId },
}

/// A single write.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create a vertex. Fails if the id is taken.
    PutVertex(Vertex),
    /// Set (or replace) one property of an existing vertex.
    SetProperty { vertex: ConceptId, property: Property },
    /// Delete a vertex together with every incident edge.
    DeleteVertex(ConceptId),
    /// Create an edge between two existing vertices.
    PutEdge(Edge),
    /// Delete an existing edge.
    DeleteEdge(EdgeId),
    /// Add a signed delta to a concept counter.
    ///
    /// The stored value is a plain sum, so deltas commute and may land in any
    /// order; readers clamp negative totals to zero.
    AddToCounter { concept: ConceptId, delta: i64 },
}

/// Preconditions plus mutations, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_version(&mut self, vertex: &Vertex) -> &mut Self {
        self.preconditions.push(Precondition::VertexVersion {
            id: vertex.id,
            version: vertex.version,
        });
        self
    }

    pub fn expect_exists(&mut self, id: ConceptId) -> &mut Self {
        self.preconditions.push(Precondition::VertexExists(id));
        self
    }

    pub fn expect_vacant(&mut self, index: ResourceIndex) -> &mut Self {
        self.preconditions.push(Precondition::IndexVacant(index));
        self
    }

    pub fn expect_type_vacant(&mut self, label: TypeLabel, type_id: TypeId) -> &mut Self {
        self.preconditions
            .push(Precondition::TypeVacant { label, type_id });
        self
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// Raw record access inside one backend transaction.
///
/// Implementations only move records; they never enforce invariants.
/// Secondary maps (resource index, type labels, type ids) are kept in sync
/// through `link_property` / `unlink_property`.
pub(crate) trait BatchTarget {
    fn vertex(&mut self, id: ConceptId) -> StoreResult<Option<Vertex>>;
    fn write_vertex(&mut self, vertex: &Vertex) -> StoreResult<()>;
    fn remove_vertex(&mut self, id: ConceptId) -> StoreResult<()>;

    fn edge(&mut self, id: EdgeId) -> StoreResult<Option<Edge>>;
    /// Store the edge and register it in both adjacency lists.
    fn write_edge(&mut self, edge: &Edge) -> StoreResult<()>;
    /// Remove the edge and unregister it from both adjacency lists.
    fn remove_edge(&mut self, edge: &Edge) -> StoreResult<()>;
    fn edge_ids(&mut self, id: ConceptId, direction: Direction) -> StoreResult<Vec<EdgeId>>;

    fn index_members(&mut self, index: &ResourceIndex) -> StoreResult<Vec<ConceptId>>;
    fn label_owner(&mut self, label: &TypeLabel) -> StoreResult<Option<ConceptId>>;
    fn type_id_owner(&mut self, type_id: TypeId) -> StoreResult<Option<ConceptId>>;
    fn link_property(&mut self, id: ConceptId, property: &Property) -> StoreResult<()>;
    fn unlink_property(&mut self, id: ConceptId, property: &Property) -> StoreResult<()>;

    fn counter(&mut self, concept: ConceptId) -> StoreResult<Option<i64>>;
    fn write_counter(&mut self, concept: ConceptId, value: i64) -> StoreResult<()>;
}

/// Check every precondition, then apply every mutation in order.
///
/// On error the caller must discard the backend transaction: partial effects
/// may already have been written to it.
pub(crate) fn apply_batch<T: BatchTarget>(target: &mut T, batch: WriteBatch) -> StoreResult<()> {
    for precondition in &batch.preconditions {
        check(target, precondition)?;
    }
    for mutation in batch.mutations {
        apply_one(target, mutation)?;
    }
    Ok(())
}

fn check<T: BatchTarget>(target: &mut T, precondition: &Precondition) -> StoreResult<()> {
    match precondition {
        Precondition::VertexVersion { id, version } => match target.vertex(*id)? {
            Some(v) if v.version == *version => Ok(()),
            Some(v) => Err(StoreError::Conflict {
                reason: format!("{id} moved from version {version} to {}", v.version),
            }),
            None => Err(StoreError::Conflict {
                reason: format!("{id} was deleted"),
            }),
        },
        Precondition::VertexExists(id) => match target.vertex(*id)? {
            Some(_) => Ok(()),
            None => Err(StoreError::Conflict {
                reason: format!("{id} was deleted"),
            }),
        },
        Precondition::IndexVacant(index) => {
            if target.index_members(index)?.is_empty() {
                Ok(())
            } else {
                Err(StoreError::IndexOccupied {
                    index: index.to_string(),
                })
            }
        }
        Precondition::TypeVacant { label, type_id } => {
            let owner = match target.label_owner(label)? {
                Some(owner) => Some(owner),
                None => target.type_id_owner(*type_id)?,
            };
            match owner {
                None => Ok(()),
                Some(owner) => Err(StoreError::TypeTaken {
                    label: label.to_string(),
                    type_id: type_id.get(),
                    owner: owner.get(),
                }),
            }
        }
    }
}

fn apply_one<T: BatchTarget>(target: &mut T, mutation: Mutation) -> StoreResult<()> {
    match mutation {
        Mutation::PutVertex(mut vertex) => {
            if target.vertex(vertex.id)?.is_some() {
                return Err(StoreError::AlreadyExists {
                    what: "vertex",
                    id: vertex.id.get(),
                });
            }
            vertex.version = 1;
            for property in vertex.properties.values() {
                target.link_property(vertex.id, property)?;
            }
            target.write_vertex(&vertex)
        }
        Mutation::SetProperty { vertex, property } => {
            let mut v = require_vertex(target, vertex)?;
            if let Some(old) = v.properties.insert(property.key(), property.clone()) {
                target.unlink_property(vertex, &old)?;
            }
            target.link_property(vertex, &property)?;
            v.version += 1;
            target.write_vertex(&v)
        }
        Mutation::DeleteVertex(id) => {
            let v = require_vertex(target, id)?;
            let mut edge_ids = target.edge_ids(id, Direction::Both)?;
            edge_ids.sort_unstable();
            edge_ids.dedup();
            for edge_id in edge_ids {
                if let Some(edge) = target.edge(edge_id)? {
                    target.remove_edge(&edge)?;
                    let other = edge.other_end(id);
                    if other != id {
                        touch(target, other)?;
                    }
                }
            }
            for property in v.properties.values() {
                target.unlink_property(id, property)?;
            }
            target.remove_vertex(id)
        }
        Mutation::PutEdge(edge) => {
            if target.edge(edge.id)?.is_some() {
                return Err(StoreError::AlreadyExists {
                    what: "edge",
                    id: edge.id.get(),
                });
            }
            require_vertex(target, edge.source)?;
            require_vertex(target, edge.target)?;
            target.write_edge(&edge)?;
            touch(target, edge.source)?;
            if edge.target != edge.source {
                touch(target, edge.target)?;
            }
            Ok(())
        }
        Mutation::DeleteEdge(id) => {
            let edge = target.edge(id)?.ok_or(StoreError::NotFound {
                what: "edge",
                id: id.get(),
            })?;
            target.remove_edge(&edge)?;
            touch(target, edge.source)?;
            if edge.target != edge.source {
                touch(target, edge.target)?;
            }
            Ok(())
        }
        Mutation::AddToCounter { concept, delta } => {
            let current = target.counter(concept)?.unwrap_or(0);
            target.write_counter(concept, current.saturating_add(delta))
        }
    }
}

fn require_vertex<T: BatchTarget>(target: &mut T, id: ConceptId) -> StoreResult<Vertex> {
    target.vertex(id)?.ok_or(StoreError::NotFound {
        what: "vertex",
        id: id.get(),
    })
}

/// Bump the version of a vertex if it still exists.
fn touch<T: BatchTarget>(target: &mut T, id: ConceptId) -> StoreResult<()> {
    if let Some(mut v) = target.vertex(id)? {
        v.version += 1;
        target.write_vertex(&v)?;
    }
    Ok(())
}
