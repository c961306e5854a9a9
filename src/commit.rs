//! Commit coordination.
//!
//! A validated commit checks the transaction inline (no second live holder
//! of any resource index it writes, no instance past the degree bound) and
//! guards each new index with an `IndexVacant` precondition, so a racing
//! writer cannot slip a duplicate in between check and apply. A deferred
//! commit applies the writes unchecked and reports every touched index in
//! its log for the repair pass.

use std::collections::BTreeMap;

use crate::commit_log::CommitLog;
use crate::concept::ResourceIndex;
use crate::error::{CommitError, GraphResult, StoreError, Violation};
use crate::graph::Transaction;
use crate::session::Session;
use crate::store::{ConceptProperty, Direction, StoreResult};

/// How a transaction is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitMode {
    /// Check inline; the log carries count changes only.
    Validated,
    /// Skip the checks; the log carries touched indices and count changes.
    Deferred,
}

pub(crate) struct CommitCoordinator<'a> {
    session: &'a Session,
}

impl<'a> CommitCoordinator<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    pub fn commit(&self, tx: Transaction, mode: CommitMode) -> GraphResult<CommitLog> {
        let Transaction {
            mut batch,
            resources,
            counts,
            types,
            ..
        } = match mode {
            CommitMode::Validated => self.validated(tx)?,
            CommitMode::Deferred => tx,
        };

        let writes = batch.len();
        if !batch.is_empty() {
            let store = self.session.store();
            if mode == CommitMode::Validated {
                for index in resources.keys() {
                    // Holders deleted by this same transaction do not count.
                    if store.lookup(&ConceptProperty::Index(index.clone()))?.is_empty() {
                        batch.expect_vacant(index.clone());
                    }
                }
            }
            if let Err(e) = store.apply(batch) {
                return Err(match e {
                    StoreError::IndexOccupied { index } => self.occupied(index).into(),
                    other => other.into(),
                });
            }
        }

        // The batch's `TypeVacant` guards already rejected any label or id
        // another session owns.
        let registry = self.session.registry();
        for (handle, _) in types {
            registry.register(handle)?;
        }

        let mut log = CommitLog::new(self.session.keyspace());
        if mode == CommitMode::Deferred {
            for (index, ids) in resources {
                for id in ids {
                    log.record_resource(index.clone(), id);
                }
            }
        }
        for (concept, delta) in counts {
            log.record_count(concept, delta);
        }

        tracing::debug!(
            keyspace = %log.keyspace,
            writes,
            deferred = mode == CommitMode::Deferred,
            indices = log.resources.len(),
            counts = log.concept_counts.len(),
            "committed transaction"
        );
        Ok(log)
    }

    /// A racing writer took an index between validation and apply.
    fn occupied(&self, index: String) -> CommitError {
        let existing = self
            .session
            .store()
            .lookup(&ConceptProperty::Index(ResourceIndex::from_raw(index.clone())))
            .ok()
            .and_then(|ids| ids.first().map(|id| id.get()))
            .unwrap_or(0);
        CommitError::InvalidGraph {
            violations: vec![Violation::DuplicateResource { index, existing }],
        }
    }

    /// Run the inline checks; the transaction comes back untouched on success.
    fn validated(&self, tx: Transaction) -> GraphResult<Transaction> {
        let violations = self.violations(&tx)?;
        if violations.is_empty() {
            Ok(tx)
        } else {
            tracing::debug!(violations = violations.len(), "inline validation failed, rolling back");
            Err(CommitError::InvalidGraph { violations }.into())
        }
    }

    fn violations(&self, tx: &Transaction) -> StoreResult<Vec<Violation>> {
        let store = self.session.store();
        let mut violations = Vec::new();

        for (index, ids) in &tx.resources {
            let held: Vec<_> = store
                .lookup(&ConceptProperty::Index(index.clone()))?
                .into_iter()
                .filter(|id| !tx.deleted.contains(id))
                .collect();
            if let Some(existing) = held.first() {
                violations.push(Violation::DuplicateResource {
                    index: index.to_string(),
                    existing: existing.get(),
                });
            } else if ids.len() > 1 {
                if let Some(first) = ids.first() {
                    violations.push(Violation::DuplicateResource {
                        index: index.to_string(),
                        existing: first.get(),
                    });
                }
            }
        }

        if let Some(max) = self.session.config().max_vertex_degree {
            let mut degrees: BTreeMap<_, usize> = BTreeMap::new();
            for (&id, &added) in &tx.added_degree {
                if tx.deleted.contains(&id) {
                    continue;
                }
                let existing = if tx.created.contains_key(&id) {
                    0
                } else {
                    store.edges(id, Direction::Both)?.len()
                };
                degrees.insert(id, existing + added);
            }
            for (id, degree) in degrees {
                if degree > max {
                    violations.push(Violation::DegreeExceeded {
                        concept: id.get(),
                        degree,
                        max,
                    });
                }
            }
        }

        Ok(violations)
    }
}
