//! Durable per-concept instance counters.
//!
//! Counters live in the store and are only changed through atomic
//! `AddToCounter` mutations, so concurrent updates never lose a delta. The
//! store keeps the signed sum: a merge may book its `-1` before the commit
//! log carrying the matching `+1` is applied. Reads clamp at zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::concept::ConceptId;
use crate::registry::TypeHandle;
use crate::store::{GraphStore, Mutation, StoreResult, WriteBatch};

/// Reads and updates concept counters.
#[derive(Clone)]
pub struct ConceptCountTracker {
    store: Arc<dyn GraphStore>,
}

impl ConceptCountTracker {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Current count; zero for a concept that was never counted or whose
    /// pending decrements outnumber its increments.
    pub fn count(&self, concept: ConceptId) -> StoreResult<u64> {
        let raw = self.store.counter(concept)?.unwrap_or(0);
        Ok(u64::try_from(raw).unwrap_or(0))
    }

    /// Instance count of a type.
    pub fn count_of(&self, handle: &TypeHandle) -> StoreResult<u64> {
        self.count(handle.concept_id())
    }

    /// Apply every non-zero delta in one atomic batch.
    ///
    /// Deltas add to the stored sum in any order; an unknown concept starts
    /// from zero.
    pub fn apply(&self, deltas: &BTreeMap<ConceptId, i64>) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        for (&concept, &delta) in deltas {
            if delta != 0 {
                batch.push(Mutation::AddToCounter { concept, delta });
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        let applied = batch.len();
        self.store.apply(batch)?;
        tracing::debug!(concepts = applied, "applied concept count deltas");
        Ok(())
    }
}

impl std::fmt::Debug for ConceptCountTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConceptCountTracker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemGraphStore;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    #[test]
    fn deltas_accumulate_and_clamp() {
        let tracker = ConceptCountTracker::new(Arc::new(MemGraphStore::new()));
        let concept = cid(40);

        for delta in [3, -1, -1] {
            tracker.apply(&BTreeMap::from([(concept, delta)])).unwrap();
        }
        assert_eq!(tracker.count(concept).unwrap(), 1);

        tracker.apply(&BTreeMap::from([(concept, -10)])).unwrap();
        assert_eq!(tracker.count(concept).unwrap(), 0);
    }

    #[test]
    fn decrements_before_increments_still_add_up() {
        let tracker = ConceptCountTracker::new(Arc::new(MemGraphStore::new()));
        let concept = cid(41);

        for delta in [-1, -1] {
            tracker.apply(&BTreeMap::from([(concept, delta)])).unwrap();
        }
        assert_eq!(tracker.count(concept).unwrap(), 0);

        tracker.apply(&BTreeMap::from([(concept, 3)])).unwrap();
        assert_eq!(tracker.count(concept).unwrap(), 1);
    }

    #[test]
    fn unknown_concept_starts_at_delta() {
        let tracker = ConceptCountTracker::new(Arc::new(MemGraphStore::new()));
        assert_eq!(tracker.count(cid(7)).unwrap(), 0);
        tracker
            .apply(&BTreeMap::from([(cid(7), 5), (cid(8), -2)]))
            .unwrap();
        assert_eq!(tracker.count(cid(7)).unwrap(), 5);
        assert_eq!(tracker.count(cid(8)).unwrap(), 0);
    }

    #[test]
    fn zero_deltas_write_nothing() {
        let store = Arc::new(MemGraphStore::new());
        let tracker = ConceptCountTracker::new(store.clone());
        tracker.apply(&BTreeMap::from([(cid(3), 0)])).unwrap();
        assert_eq!(store.counter(cid(3)).unwrap(), None);
    }
}
