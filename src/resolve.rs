//! Duplicate resource detection and merging.
//!
//! Batch-mode writers create resources without checking the index, so one
//! index can end up held by several live vertices. The resolver folds them
//! into a single survivor: every edge of a loser is re-pointed onto the
//! survivor (deduplicated by edge key), the loser is deleted, and its type
//! count drops by one. The whole merge is one store batch guarded by the
//! versions of every vertex involved, so a merge either lands completely or
//! is re-evaluated from scratch.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::concept::{ConceptId, ResourceIndex};
use crate::config::SurvivorPolicy;
use crate::error::{GraphResult, StoreError};
use crate::store::{
    BaseType, ConceptProperty, Direction, Edge, EdgeKey, EdgeLabel, GraphStore, Mutation,
    StoreResult, Vertex, WriteBatch,
};

/// Outcome of one successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge {
    pub survivor: ConceptId,
    pub merged: Vec<ConceptId>,
}

/// Stateless merger of resource vertices that share an index.
#[derive(Clone)]
pub struct DuplicateResourceResolver {
    store: Arc<dyn GraphStore>,
    policy: SurvivorPolicy,
    max_conflict_retries: usize,
}

impl DuplicateResourceResolver {
    pub fn new(
        store: Arc<dyn GraphStore>,
        policy: SurvivorPolicy,
        max_conflict_retries: usize,
    ) -> Self {
        Self {
            store,
            policy,
            max_conflict_retries,
        }
    }

    /// Whether `index` is still held by more than one live resource, at least
    /// one of them among `candidates`.
    ///
    /// Candidates that no longer exist are ignored.
    pub fn duplicate_resources_exist(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> StoreResult<bool> {
        let live = self.live_set(index, candidates)?;
        let any_candidate = live.iter().any(|v| candidates.contains(&v.id));
        Ok(any_candidate && live.len() >= 2)
    }

    /// Merge every live holder of `index` into one survivor.
    ///
    /// Returns `false` if fewer than two live holders remain.
    pub fn fix_duplicate_resources(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> GraphResult<bool> {
        Ok(self.merge(index, candidates)?.is_some())
    }

    /// Like [`fix_duplicate_resources`](Self::fix_duplicate_resources), but
    /// reports which vertices were merged.
    pub fn merge(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> GraphResult<Option<Merge>> {
        let mut attempt = 0;
        loop {
            match self.try_merge(index, candidates) {
                Err(StoreError::Conflict { reason }) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::warn!(index = %index, attempt, %reason, "merge lost a write race, re-evaluating");
                }
                other => return Ok(other?),
            }
        }
    }

    fn try_merge(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> StoreResult<Option<Merge>> {
        let live = self.live_set(index, candidates)?;
        if live.len() < 2 || !live.iter().any(|v| candidates.contains(&v.id)) {
            tracing::debug!(index = %index, live = live.len(), "nothing to merge");
            return Ok(None);
        }
        let Some(survivor) = self.policy.choose(&live) else {
            return Ok(None);
        };
        let losers: Vec<&Vertex> = live.iter().filter(|v| v.id != survivor.id).collect();

        let batch = self.merge_batch(survivor, &losers)?;
        self.store.apply(batch)?;

        let merge = Merge {
            survivor: survivor.id,
            merged: losers.iter().map(|v| v.id).collect(),
        };
        tracing::info!(
            index = %index,
            survivor = %merge.survivor,
            merged = merge.merged.len(),
            "merged duplicate resources"
        );
        Ok(Some(merge))
    }

    /// Live resource vertices carrying `index`: the candidates plus any other
    /// holder the store knows about, ascending by id.
    fn live_set(
        &self,
        index: &ResourceIndex,
        candidates: &BTreeSet<ConceptId>,
    ) -> StoreResult<Vec<Vertex>> {
        let mut ids = candidates.clone();
        ids.extend(self.store.lookup(&ConceptProperty::Index(index.clone()))?);

        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_vertex(id)? {
                Some(v) if v.base == BaseType::Resource && v.index() == Some(index) => live.push(v),
                _ => {}
            }
        }
        Ok(live)
    }

    fn merge_batch(&self, survivor: &Vertex, losers: &[&Vertex]) -> StoreResult<WriteBatch> {
        let loser_ids: HashSet<ConceptId> = losers.iter().map(|v| v.id).collect();
        let remap = |id: ConceptId| {
            if loser_ids.contains(&id) {
                survivor.id
            } else {
                id
            }
        };

        let mut batch = WriteBatch::new();
        batch.expect_version(survivor);
        for loser in losers {
            batch.expect_version(loser);
        }

        let mut present: HashSet<EdgeKey> = self
            .store
            .edges(survivor.id, Direction::Both)?
            .iter()
            .filter(|e| !loser_ids.contains(&e.other_end(survivor.id)))
            .map(Edge::key)
            .collect();
        let mut removed = HashSet::new();
        let mut anchors = BTreeSet::new();
        let mut deltas: BTreeMap<ConceptId, i64> = BTreeMap::new();

        for loser in losers {
            for edge in self.store.edges(loser.id, Direction::Both)? {
                if !removed.insert(edge.id) {
                    continue;
                }
                batch.push(Mutation::DeleteEdge(edge.id));

                // The survivor already has its own type membership.
                if edge.label == EdgeLabel::Isa && loser_ids.contains(&edge.source) {
                    continue;
                }
                let (source, target) = (remap(edge.source), remap(edge.target));
                let moved = Edge {
                    id: self.store.allocate_edge_id()?,
                    label: edge.label,
                    source,
                    target,
                    role: edge.role,
                };
                if present.insert(moved.key()) {
                    for end in [source, target] {
                        if end != survivor.id {
                            anchors.insert(end);
                        }
                    }
                    batch.push(Mutation::PutEdge(moved));
                }
            }
            if let Some(type_vertex) = loser.instance_of() {
                *deltas.entry(type_vertex).or_default() -= 1;
            }
        }

        for anchor in anchors {
            batch.expect_exists(anchor);
        }
        for loser in losers {
            batch.push(Mutation::DeleteVertex(loser.id));
        }
        for (concept, delta) in deltas {
            batch.push(Mutation::AddToCounter { concept, delta });
        }
        Ok(batch)
    }
}

impl std::fmt::Debug for DuplicateResourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateResourceResolver")
            .field("policy", &self.policy)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{ResourceValue, TypeId};
    use crate::store::{EdgeId, MemGraphStore, Property};

    struct Fixture {
        store: Arc<MemGraphStore>,
        email_type: ConceptId,
        index: ResourceIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemGraphStore::new());
            let email_type = store.allocate_concept_id().unwrap();
            let mut batch = WriteBatch::new();
            batch.push(Mutation::PutVertex(Vertex::new(email_type, BaseType::Type)));
            store.apply(batch).unwrap();
            let value = ResourceValue::from("a@example.com");
            Self {
                store,
                email_type,
                index: ResourceIndex::of(TypeId::new(8), &value),
            }
        }

        fn resource(&self) -> ConceptId {
            let id = self.store.allocate_concept_id().unwrap();
            let mut batch = WriteBatch::new();
            batch.push(Mutation::PutVertex(
                Vertex::new(id, BaseType::Resource)
                    .with(Property::Index(self.index.clone()))
                    .with(Property::Value("a@example.com".into()))
                    .with(Property::InstanceOf(self.email_type)),
            ));
            batch.push(Mutation::PutEdge(self.edge(EdgeLabel::Isa, id, self.email_type)));
            batch.push(Mutation::AddToCounter {
                concept: self.email_type,
                delta: 1,
            });
            self.store.apply(batch).unwrap();
            id
        }

        fn entity(&self) -> ConceptId {
            let id = self.store.allocate_concept_id().unwrap();
            let mut batch = WriteBatch::new();
            batch.push(Mutation::PutVertex(Vertex::new(id, BaseType::Entity)));
            self.store.apply(batch).unwrap();
            id
        }

        fn edge(&self, label: EdgeLabel, source: ConceptId, target: ConceptId) -> Edge {
            let id: EdgeId = self.store.allocate_edge_id().unwrap();
            Edge::new(id, label, source, target)
        }

        fn link(&self, source: ConceptId, target: ConceptId) {
            let mut batch = WriteBatch::new();
            batch.push(Mutation::PutEdge(
                self.edge(EdgeLabel::RolePlayer, source, target)
                    .with_role(TypeId::new(9)),
            ));
            self.store.apply(batch).unwrap();
        }

        fn resolver(&self) -> DuplicateResourceResolver {
            DuplicateResourceResolver::new(self.store.clone(), SurvivorPolicy::LowestId, 4)
        }
    }

    #[test]
    fn merge_keeps_lowest_id_and_moves_edges() {
        let fx = Fixture::new();
        let a = fx.resource();
        let b = fx.resource();
        let owner_a = fx.entity();
        let owner_b = fx.entity();
        fx.link(owner_a, a);
        fx.link(owner_b, b);

        let resolver = fx.resolver();
        let candidates = BTreeSet::from([a, b]);
        assert!(resolver.duplicate_resources_exist(&fx.index, &candidates).unwrap());
        assert!(resolver.fix_duplicate_resources(&fx.index, &candidates).unwrap());

        assert!(fx.store.get_vertex(b).unwrap().is_none());
        assert_eq!(
            fx.store.lookup(&ConceptProperty::Index(fx.index.clone())).unwrap(),
            vec![a]
        );
        let players: BTreeSet<ConceptId> = fx
            .store
            .edges(a, Direction::Incoming)
            .unwrap()
            .into_iter()
            .filter(|e| e.label == EdgeLabel::RolePlayer)
            .map(|e| e.source)
            .collect();
        assert_eq!(players, BTreeSet::from([owner_a, owner_b]));

        let isa: Vec<Edge> = fx
            .store
            .edges(a, Direction::Outgoing)
            .unwrap()
            .into_iter()
            .filter(|e| e.label == EdgeLabel::Isa)
            .collect();
        assert_eq!(isa.len(), 1);
        assert_eq!(fx.store.counter(fx.email_type).unwrap(), Some(1));

        assert!(!resolver.fix_duplicate_resources(&fx.index, &candidates).unwrap());
        assert!(!resolver.duplicate_resources_exist(&fx.index, &candidates).unwrap());
    }

    #[test]
    fn shared_neighbours_do_not_duplicate_edges() {
        let fx = Fixture::new();
        let a = fx.resource();
        let b = fx.resource();
        let owner = fx.entity();
        fx.link(owner, a);
        fx.link(owner, b);

        fx.resolver()
            .fix_duplicate_resources(&fx.index, &BTreeSet::from([a, b]))
            .unwrap();

        let incoming = fx.store.edges(a, Direction::Incoming).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, owner);
    }

    #[test]
    fn missing_candidates_are_tolerated() {
        let fx = Fixture::new();
        let a = fx.resource();
        let gone = ConceptId::new(10_000).unwrap();
        let resolver = fx.resolver();
        let candidates = BTreeSet::from([a, gone]);
        assert!(!resolver.duplicate_resources_exist(&fx.index, &candidates).unwrap());
        assert!(!resolver.fix_duplicate_resources(&fx.index, &candidates).unwrap());
        assert!(fx.store.get_vertex(a).unwrap().is_some());
    }

    #[test]
    fn overlapping_candidate_sets_converge() {
        let fx = Fixture::new();
        let a = fx.resource();
        let b = fx.resource();
        let c = fx.resource();
        let resolver = fx.resolver();

        assert!(resolver
            .fix_duplicate_resources(&fx.index, &BTreeSet::from([b, c]))
            .unwrap());
        assert!(!resolver
            .fix_duplicate_resources(&fx.index, &BTreeSet::from([a, b]))
            .unwrap());
        assert_eq!(
            fx.store.lookup(&ConceptProperty::Index(fx.index.clone())).unwrap(),
            vec![a]
        );
        assert_eq!(fx.store.counter(fx.email_type).unwrap(), Some(1));
    }

    #[test]
    fn highest_id_policy_keeps_newest() {
        let fx = Fixture::new();
        let a = fx.resource();
        let b = fx.resource();
        let resolver =
            DuplicateResourceResolver::new(fx.store.clone(), SurvivorPolicy::HighestId, 4);
        let merge = resolver
            .merge(&fx.index, &BTreeSet::from([a, b]))
            .unwrap()
            .unwrap();
        assert_eq!(merge.survivor, b);
        assert_eq!(merge.merged, vec![a]);
    }
}
