//! Sharding of high fan-out concepts.
//!
//! An owner concept records its `CurrentShard` and its `ShardGeneration`.
//! The generation a counter calls for is `count / threshold`; whenever it
//! exceeds the recorded generation the owner gets one new shard and the
//! recorded generation jumps to the target. Shards are never removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::concept::ConceptId;
use crate::counts::ConceptCountTracker;
use crate::error::{GraphResult, StoreError};
use crate::store::{
    BaseType, Direction, Edge, EdgeLabel, GraphStore, Mutation, Property, StoreResult, Vertex,
    WriteBatch,
};

/// Creates shards for concepts whose counters crossed the threshold.
#[derive(Clone)]
pub struct ShardingEngine {
    store: Arc<dyn GraphStore>,
    counts: ConceptCountTracker,
    threshold: u64,
    max_conflict_retries: usize,
}

impl ShardingEngine {
    pub fn new(store: Arc<dyn GraphStore>, threshold: u64, max_conflict_retries: usize) -> Self {
        Self {
            counts: ConceptCountTracker::new(store.clone()),
            store,
            threshold: threshold.max(1),
            max_conflict_retries,
        }
    }

    pub fn counts(&self) -> &ConceptCountTracker {
        &self.counts
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Generation a counter value calls for.
    pub fn generation_for(&self, count: u64) -> u64 {
        count / self.threshold
    }

    /// Apply count deltas atomically and return the concepts now due a shard.
    pub fn update_concept_counts(
        &self,
        deltas: &BTreeMap<ConceptId, i64>,
    ) -> GraphResult<Vec<ConceptId>> {
        self.counts.apply(deltas)?;
        let mut due = Vec::new();
        for &concept in deltas.keys() {
            if self.needs_shard(concept)? {
                due.push(concept);
            }
        }
        if !due.is_empty() {
            tracing::debug!(concepts = due.len(), "concepts crossed shard threshold");
        }
        Ok(due)
    }

    /// Whether the concept's counter has outrun its recorded shard generation.
    pub fn needs_shard(&self, concept: ConceptId) -> StoreResult<bool> {
        let Some(owner) = self.shardable(concept)? else {
            return Ok(false);
        };
        let target = self.generation_for(self.counts.count(concept)?);
        Ok(target > owner.shard_generation())
    }

    /// Give `concept` a new shard if its counter calls for one.
    ///
    /// Redundant and concurrent calls for the same crossing create exactly one
    /// shard; the others return `false`.
    pub fn shard(&self, concept: ConceptId) -> GraphResult<bool> {
        let mut attempt = 0;
        loop {
            match self.try_shard(concept) {
                Err(StoreError::Conflict { reason }) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::warn!(concept = %concept, attempt, %reason, "shard lost a write race, re-reading");
                }
                other => return Ok(other?),
            }
        }
    }

    fn try_shard(&self, concept: ConceptId) -> StoreResult<bool> {
        let Some(owner) = self.shardable(concept)? else {
            tracing::debug!(concept = %concept, "not a shardable concept");
            return Ok(false);
        };
        let count = self.counts.count(concept)?;
        let target = self.generation_for(count);
        if target <= owner.shard_generation() {
            tracing::debug!(concept = %concept, count, generation = owner.shard_generation(), "shard not needed");
            return Ok(false);
        }

        let shard = self.store.allocate_concept_id()?;
        let mut batch = WriteBatch::new();
        batch.expect_version(&owner);
        batch.push(Mutation::PutVertex(
            Vertex::new(shard, BaseType::Shard).with(Property::ShardOwner(concept)),
        ));
        batch.push(Mutation::PutEdge(Edge::new(
            self.store.allocate_edge_id()?,
            EdgeLabel::Shard,
            shard,
            concept,
        )));
        batch.push(Mutation::SetProperty {
            vertex: concept,
            property: Property::CurrentShard(shard),
        });
        batch.push(Mutation::SetProperty {
            vertex: concept,
            property: Property::ShardGeneration(target),
        });
        self.store.apply(batch)?;

        tracing::info!(concept = %concept, shard = %shard, generation = target, count, "created shard");
        Ok(true)
    }

    /// Shards owned by `concept`, oldest first.
    pub fn shards(&self, concept: ConceptId) -> StoreResult<Vec<ConceptId>> {
        let mut shards: Vec<ConceptId> = self
            .store
            .edges(concept, Direction::Incoming)?
            .into_iter()
            .filter(|e| e.label == EdgeLabel::Shard)
            .map(|e| e.source)
            .collect();
        shards.sort_unstable();
        Ok(shards)
    }

    /// The owner vertex, if it exists and carries a current shard.
    fn shardable(&self, concept: ConceptId) -> StoreResult<Option<Vertex>> {
        Ok(self
            .store
            .get_vertex(concept)?
            .filter(|v| v.current_shard().is_some()))
    }
}

impl std::fmt::Debug for ShardingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardingEngine")
            .field("threshold", &self.threshold)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{TypeId, TypeLabel};
    use crate::registry::MetaKind;
    use crate::schema::{self, TypeSpec};
    use crate::store::MemGraphStore;

    fn owner(store: &Arc<MemGraphStore>) -> ConceptId {
        let mut batch = WriteBatch::new();
        let (handle, _) = schema::push_type(
            store.as_ref(),
            &mut batch,
            TypeSpec {
                label: TypeLabel::new("person"),
                type_id: TypeId::new(8),
                kind: MetaKind::Entity,
                data_type: None,
                super_type: None,
            },
        )
        .unwrap();
        store.apply(batch).unwrap();
        handle.concept_id()
    }

    #[test]
    fn shard_only_after_threshold() {
        let store = Arc::new(MemGraphStore::new());
        let person = owner(&store);
        let engine = ShardingEngine::new(store.clone(), 100, 4);

        let due = engine
            .update_concept_counts(&BTreeMap::from([(person, 99)]))
            .unwrap();
        assert!(due.is_empty());
        assert!(!engine.shard(person).unwrap());
        assert_eq!(engine.shards(person).unwrap().len(), 1);

        let due = engine
            .update_concept_counts(&BTreeMap::from([(person, 1)]))
            .unwrap();
        assert_eq!(due, vec![person]);
        assert!(engine.shard(person).unwrap());
        assert!(!engine.shard(person).unwrap());

        let shards = engine.shards(person).unwrap();
        assert_eq!(shards.len(), 2);
        let vertex = store.get_vertex(person).unwrap().unwrap();
        assert_eq!(vertex.current_shard(), Some(shards[1]));
        assert_eq!(vertex.shard_generation(), 1);
    }

    #[test]
    fn one_shard_per_call_even_after_several_crossings() {
        let store = Arc::new(MemGraphStore::new());
        let person = owner(&store);
        let engine = ShardingEngine::new(store.clone(), 10, 4);

        engine
            .update_concept_counts(&BTreeMap::from([(person, 35)]))
            .unwrap();
        assert!(engine.shard(person).unwrap());
        assert!(!engine.needs_shard(person).unwrap());
        assert_eq!(engine.shards(person).unwrap().len(), 2);
        assert_eq!(store.get_vertex(person).unwrap().unwrap().shard_generation(), 3);
    }

    #[test]
    fn unknown_concept_is_a_no_op() {
        let store = Arc::new(MemGraphStore::new());
        let engine = ShardingEngine::new(store, 10, 4);
        assert!(!engine.shard(ConceptId::new(999).unwrap()).unwrap());
    }
}
