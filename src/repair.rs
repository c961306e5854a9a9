//! The repair pass that consumes commit logs.
//!
//! Logs queue up in a [`RepairQueue`]. [`RepairDriver::run_once`] takes the
//! logs of its keyspace, folds them together and works through three kinds of
//! task in order: apply the count deltas, merge every touched resource index,
//! then shard every counted concept that crossed the threshold.
//!
//! Each task moves `Pending → InProgress → Done`. A transient failure sends it
//! through `Retry` back to `Pending` after a linear backoff; once the retry
//! budget is spent the driver stops with [`RepairError::RetriesExhausted`].
//! Whatever a failed or cancelled run did not finish goes back to the front
//! of the queue as tasks. Count deltas that were already applied are not
//! among them, so a rerun never books a delta twice.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use miette::Diagnostic;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commit_log::{CommitLog, CommitLogSink};
use crate::concept::{ConceptId, ResourceIndex};
use crate::config::RepairConfig;
use crate::error::{GraphError, GraphResult, StoreError};
use crate::session::Session;

/// Errors that stop a repair run.
#[derive(Debug, Error, Diagnostic)]
pub enum RepairError {
    #[error("repair task {task} failed")]
    #[diagnostic(
        code(akh::repair::task_failed),
        help("The failure is not transient. The unfinished tasks were requeued; fix the cause and run again.")
    )]
    TaskFailed {
        task: String,
        #[source]
        source: GraphError,
    },

    #[error("repair task {task} still failing after {attempts} attempts")]
    #[diagnostic(
        code(akh::repair::retries_exhausted),
        help("The store kept reporting transient failures. The unfinished tasks were requeued; raise repair.max_retries or repair.backoff_ms, or run again later.")
    )]
    RetriesExhausted {
        task: String,
        attempts: u32,
        #[source]
        source: GraphError,
    },

    #[error("repair cancelled before task {task}")]
    #[diagnostic(
        code(akh::repair::cancelled),
        help("The cancellation flag was raised. The unfinished tasks were requeued.")
    )]
    Cancelled { task: String },

    #[error("commit log for keyspace \"{found}\" submitted to \"{expected}\"")]
    #[diagnostic(
        code(akh::repair::keyspace_mismatch),
        help("Commit logs must be repaired against the graph that produced them.")
    )]
    KeyspaceMismatch { expected: String, found: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),
}

/// One unit of repair work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairTask {
    Counts(BTreeMap<ConceptId, i64>),
    Resource {
        index: ResourceIndex,
        candidates: BTreeSet<ConceptId>,
    },
    Shard(ConceptId),
}

impl std::fmt::Display for RepairTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairTask::Counts(deltas) => write!(f, "counts({} concepts)", deltas.len()),
            RepairTask::Resource { index, .. } => write!(f, "resource({index})"),
            RepairTask::Shard(concept) => write!(f, "shard({concept})"),
        }
    }
}

/// Lifecycle of a repair task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    InProgress,
    Retry,
    Done,
}

#[derive(Debug)]
enum Outcome {
    Counted(Vec<ConceptId>),
    Merged(usize),
    Sharded(bool),
}

/// What a repair run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub logs: usize,
    pub counts_applied: usize,
    pub resources_checked: usize,
    pub resources_merged: usize,
    pub vertices_merged: usize,
    pub shards_created: usize,
    pub retries: u32,
}

impl std::fmt::Display for RepairStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} logs, {} counts, {}/{} indices merged ({} vertices), {} shards, {} retries",
            self.logs,
            self.counts_applied,
            self.resources_merged,
            self.resources_checked,
            self.vertices_merged,
            self.shards_created,
            self.retries
        )
    }
}

/// In-process queue of commit logs awaiting repair, plus the tasks an
/// interrupted run handed back.
#[derive(Debug, Default)]
pub struct RepairQueue {
    logs: Mutex<VecDeque<CommitLog>>,
    unfinished: Mutex<VecDeque<(String, RepairTask)>>,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued logs plus requeued tasks.
    pub fn len(&self) -> usize {
        let logs = self.logs.lock().map(|q| q.len()).unwrap_or(0);
        let tasks = self.unfinished.lock().map(|q| q.len()).unwrap_or(0);
        logs + tasks
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued log, oldest first. Requeued tasks stay queued.
    pub fn drain(&self) -> GraphResult<Vec<CommitLog>> {
        let mut logs = self.logs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(logs.drain(..).collect())
    }

    /// Tasks handed back by interrupted runs, in the order they will be retried.
    pub fn unfinished(&self) -> GraphResult<Vec<RepairTask>> {
        let tasks = self.unfinished.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(tasks.iter().map(|(_, task)| task.clone()).collect())
    }

    /// Take the requeued tasks and the logs of `keyspace`; everything else stays.
    fn take(&self, keyspace: &str) -> GraphResult<(Vec<RepairTask>, Vec<CommitLog>)> {
        let mut unfinished = self.unfinished.lock().map_err(|_| StoreError::Poisoned)?;
        let mut logs = self.logs.lock().map_err(|_| StoreError::Poisoned)?;

        let (ours, theirs): (VecDeque<_>, VecDeque<_>) =
            unfinished.drain(..).partition(|(ks, _)| ks == keyspace);
        *unfinished = theirs;
        let (mine, foreign): (VecDeque<_>, VecDeque<_>) =
            logs.drain(..).partition(|log| log.keyspace == keyspace);
        if !foreign.is_empty() {
            tracing::warn!(
                keyspace,
                foreign = foreign.len(),
                "leaving commit logs of other keyspaces queued"
            );
        }
        *logs = foreign;

        Ok((
            ours.into_iter().map(|(_, task)| task).collect(),
            mine.into_iter().collect(),
        ))
    }

    /// Put unfinished tasks back at the front, ahead of any newer work.
    pub fn requeue(&self, keyspace: &str, tasks: Vec<RepairTask>) -> GraphResult<()> {
        let mut unfinished = self.unfinished.lock().map_err(|_| StoreError::Poisoned)?;
        for task in tasks.into_iter().rev() {
            unfinished.push_front((keyspace.to_string(), task));
        }
        Ok(())
    }
}

impl CommitLogSink for RepairQueue {
    fn submit(&self, log: CommitLog) -> GraphResult<()> {
        if log.is_empty() {
            return Ok(());
        }
        let mut logs = self.logs.lock().map_err(|_| StoreError::Poisoned)?;
        logs.push_back(log);
        Ok(())
    }
}

/// Work of one run not yet done.
#[derive(Debug, Default)]
struct Backlog {
    counts: BTreeMap<ConceptId, i64>,
    resources: BTreeMap<ResourceIndex, BTreeSet<ConceptId>>,
    shards: BTreeSet<ConceptId>,
}

impl Backlog {
    fn push(&mut self, task: RepairTask) {
        match task {
            RepairTask::Counts(deltas) => {
                for (concept, delta) in deltas {
                    *self.counts.entry(concept).or_default() += delta;
                }
            }
            RepairTask::Resource { index, candidates } => {
                self.resources.entry(index).or_default().extend(candidates);
            }
            RepairTask::Shard(concept) => {
                self.shards.insert(concept);
            }
        }
    }

    fn fold(&mut self, log: CommitLog) {
        self.push(RepairTask::Counts(log.concept_counts));
        for (index, candidates) in log.resources {
            self.push(RepairTask::Resource { index, candidates });
        }
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.resources.is_empty() && self.shards.is_empty()
    }

    /// Remaining tasks in execution order.
    fn into_tasks(self) -> Vec<RepairTask> {
        let mut tasks = Vec::new();
        if !self.counts.is_empty() {
            tasks.push(RepairTask::Counts(self.counts));
        }
        tasks.extend(
            self.resources
                .into_iter()
                .map(|(index, candidates)| RepairTask::Resource { index, candidates }),
        );
        tasks.extend(self.shards.into_iter().map(RepairTask::Shard));
        tasks
    }
}

/// Drives commit logs through the repair operations of a session.
pub struct RepairDriver {
    session: Session,
    queue: Arc<RepairQueue>,
    config: RepairConfig,
    cancel: Arc<AtomicBool>,
    states: DashMap<String, TaskState>,
}

impl RepairDriver {
    pub fn new(session: Session, queue: Arc<RepairQueue>) -> Self {
        let config = session.config().repair.clone();
        Self {
            session,
            queue,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            states: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: RepairConfig) -> Self {
        self.config = config;
        self
    }

    /// Flag that stops the driver before its next task when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn queue(&self) -> &Arc<RepairQueue> {
        &self.queue
    }

    /// Queue a log produced by this driver's graph.
    pub fn submit(&self, log: CommitLog) -> Result<(), RepairError> {
        if log.keyspace != self.session.keyspace() {
            return Err(RepairError::KeyspaceMismatch {
                expected: self.session.keyspace().to_string(),
                found: log.keyspace,
            });
        }
        Ok(self.queue.submit(log)?)
    }

    /// State of every task of the latest run, ordered by task name.
    pub fn task_states(&self) -> Vec<(String, TaskState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Repair everything queued for this keyspace.
    pub fn run_once(&self) -> Result<RepairStats, RepairError> {
        self.process(self.config.parallel)
    }

    /// Like [`run_once`](Self::run_once), merging independent indices on the rayon pool.
    pub fn run_parallel(&self) -> Result<RepairStats, RepairError> {
        self.process(true)
    }

    fn process(&self, parallel: bool) -> Result<RepairStats, RepairError> {
        let keyspace = self.session.keyspace();
        let (requeued, logs) = self.queue.take(keyspace)?;
        let mut stats = RepairStats {
            logs: logs.len(),
            ..Default::default()
        };

        let mut backlog = Backlog::default();
        for task in requeued {
            backlog.push(task);
        }
        for log in logs {
            backlog.fold(log);
        }
        backlog.counts.retain(|_, delta| *delta != 0);
        self.states.clear();
        if backlog.is_empty() {
            return Ok(stats);
        }

        match self.work(&mut backlog, &mut stats, parallel) {
            Ok(()) => {
                tracing::info!(keyspace = %keyspace, %stats, "repair run finished");
                Ok(stats)
            }
            Err(e) => {
                let tasks = std::mem::take(&mut backlog).into_tasks();
                for task in &tasks {
                    self.enter(task, TaskState::Pending);
                }
                tracing::warn!(keyspace = %keyspace, requeued = tasks.len(), error = %e, "repair run interrupted");
                self.queue.requeue(keyspace, tasks)?;
                Err(e)
            }
        }
    }

    /// Work through the backlog, removing each task as it completes.
    fn work(
        &self,
        backlog: &mut Backlog,
        stats: &mut RepairStats,
        parallel: bool,
    ) -> Result<(), RepairError> {
        if !backlog.counts.is_empty() {
            let task = RepairTask::Counts(backlog.counts.clone());
            let (outcome, retries) = self.run_task(&task)?;
            stats.retries += retries;
            stats.counts_applied = backlog.counts.len();
            backlog.counts.clear();
            if let Outcome::Counted(due) = outcome {
                backlog.shards.extend(due);
            }
        }

        let tasks: Vec<RepairTask> = backlog
            .resources
            .iter()
            .map(|(index, candidates)| RepairTask::Resource {
                index: index.clone(),
                candidates: candidates.clone(),
            })
            .collect();
        stats.resources_checked = tasks.len();
        let results: Vec<Result<(Outcome, u32), RepairError>> = if parallel {
            tasks.par_iter().map(|task| self.run_task(task)).collect()
        } else {
            let mut results = Vec::with_capacity(tasks.len());
            for task in &tasks {
                let result = self.run_task(task);
                let failed = result.is_err();
                results.push(result);
                if failed {
                    break;
                }
            }
            results
        };

        let mut first_error = None;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok((outcome, retries)) => {
                    if let RepairTask::Resource { index, .. } = task {
                        backlog.resources.remove(index);
                    }
                    stats.retries += retries;
                    if let Outcome::Merged(n) = outcome {
                        if n > 0 {
                            stats.resources_merged += 1;
                            stats.vertices_merged += n;
                        }
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let due: Vec<ConceptId> = backlog.shards.iter().copied().collect();
        for concept in due {
            let (outcome, retries) = self.run_task(&RepairTask::Shard(concept))?;
            backlog.shards.remove(&concept);
            stats.retries += retries;
            if let Outcome::Sharded(true) = outcome {
                stats.shards_created += 1;
            }
        }
        Ok(())
    }

    /// Run one task to completion, retrying transient failures.
    ///
    /// Returns the outcome and the number of retries it took.
    fn run_task(&self, task: &RepairTask) -> Result<(Outcome, u32), RepairError> {
        self.enter(task, TaskState::Pending);
        let mut attempts = 0u32;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(RepairError::Cancelled {
                    task: task.to_string(),
                });
            }
            self.enter(task, TaskState::InProgress);
            attempts += 1;

            match self.execute(task) {
                Ok(outcome) => {
                    self.enter(task, TaskState::Done);
                    return Ok((outcome, attempts - 1));
                }
                Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                    self.enter(task, TaskState::Retry);
                    tracing::warn!(task = %task, attempts, error = %e, "transient repair failure, backing off");
                    std::thread::sleep(Duration::from_millis(
                        self.config.backoff_ms.saturating_mul(u64::from(attempts)),
                    ));
                    self.enter(task, TaskState::Pending);
                }
                Err(e) if e.is_transient() => {
                    return Err(RepairError::RetriesExhausted {
                        task: task.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(RepairError::TaskFailed {
                        task: task.to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    fn execute(&self, task: &RepairTask) -> GraphResult<Outcome> {
        match task {
            // One atomic batch: the deltas are either all booked or none are,
            // so a retried or requeued counts task never double-counts. Every
            // touched concept becomes a shard candidate; `shard` is a no-op
            // below the next threshold.
            RepairTask::Counts(deltas) => {
                self.session.counts().apply(deltas)?;
                Ok(Outcome::Counted(deltas.keys().copied().collect()))
            }
            RepairTask::Resource { index, candidates } => {
                let merged = self
                    .session
                    .resolver()
                    .merge(index, candidates)?
                    .map(|m| m.merged.len())
                    .unwrap_or(0);
                Ok(Outcome::Merged(merged))
            }
            RepairTask::Shard(concept) => Ok(Outcome::Sharded(self.session.sharding().shard(*concept)?)),
        }
    }

    fn enter(&self, task: &RepairTask, state: TaskState) {
        tracing::trace!(task = %task, state = ?state, "repair task state");
        self.states.insert(task.to_string(), state);
    }
}

impl std::fmt::Debug for RepairDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairDriver")
            .field("keyspace", &self.session.keyspace())
            .field("queued", &self.queue.len())
            .field("config", &self.config)
            .field("cancelled", &self.cancel.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::DataType;
    use crate::config::GraphConfig;

    fn batch_session(queue: &Arc<RepairQueue>) -> Session {
        let config = GraphConfig::in_memory("mail")
            .with_batch(true)
            .with_shard_threshold(3);
        Session::open(config, queue.clone()).unwrap()
    }

    #[test]
    fn empty_logs_are_not_queued() {
        let queue = RepairQueue::new();
        queue.submit(CommitLog::new("mail")).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn run_once_merges_counts_and_shards() {
        let queue = Arc::new(RepairQueue::new());
        let session = batch_session(&queue);

        let mut graph = session.graph().unwrap();
        graph.put_resource_type("email", DataType::String).unwrap();
        graph.commit().unwrap();
        queue.drain().unwrap();

        for _ in 0..4 {
            let mut graph = session.graph().unwrap();
            graph.put_resource(&"email".into(), "a@example.com").unwrap();
            graph.commit().unwrap();
        }
        let mut graph = session.graph().unwrap();
        for i in 0..3 {
            graph.put_resource(&"email".into(), format!("user{i}@example.com")).unwrap();
        }
        graph.commit().unwrap();
        assert_eq!(queue.len(), 5);

        let driver = RepairDriver::new(session.clone(), queue.clone());
        let stats = driver.run_once().unwrap();
        assert_eq!(stats.logs, 5);
        assert_eq!(stats.resources_checked, 4);
        assert_eq!(stats.resources_merged, 1);
        assert_eq!(stats.vertices_merged, 3);
        assert_eq!(stats.shards_created, 1);
        assert!(queue.is_empty());

        let email = session.registry().get(&"email".into()).unwrap();
        assert_eq!(session.counts().count_of(&email).unwrap(), 4);
        assert_eq!(session.sharding().shards(email.concept_id()).unwrap().len(), 2);

        let again = driver.run_once().unwrap();
        assert_eq!(again, RepairStats::default());
    }

    #[test]
    fn cancelled_run_requeues_its_work() {
        let queue = Arc::new(RepairQueue::new());
        let session = batch_session(&queue);
        let mut graph = session.graph().unwrap();
        graph.put_resource_type("email", DataType::String).unwrap();
        graph.commit().unwrap();
        for _ in 0..2 {
            let mut graph = session.graph().unwrap();
            graph.put_resource(&"email".into(), "a@example.com").unwrap();
            graph.commit().unwrap();
        }

        let driver = RepairDriver::new(session.clone(), queue.clone());
        driver.cancel_handle().store(true, Ordering::Release);
        assert!(matches!(
            driver.run_once(),
            Err(RepairError::Cancelled { .. })
        ));

        let unfinished = queue.unfinished().unwrap();
        assert_eq!(queue.len(), 2);
        assert!(matches!(unfinished[0], RepairTask::Counts(_)));
        assert!(matches!(unfinished[1], RepairTask::Resource { .. }));
        assert!(driver
            .task_states()
            .iter()
            .all(|(_, state)| *state == TaskState::Pending));

        driver.cancel_handle().store(false, Ordering::Release);
        let stats = driver.run_once().unwrap();
        assert_eq!(stats.vertices_merged, 1);
        assert!(queue.is_empty());
        let email = session.registry().get(&"email".into()).unwrap();
        assert_eq!(session.counts().count_of(&email).unwrap(), 1);
    }

    #[test]
    fn task_states_report_the_latest_run() {
        let queue = Arc::new(RepairQueue::new());
        let session = batch_session(&queue);
        let mut graph = session.graph().unwrap();
        graph.put_resource_type("email", DataType::String).unwrap();
        graph.put_resource(&"email".into(), "a@example.com").unwrap();
        graph.commit().unwrap();

        let driver = RepairDriver::new(session, queue);
        driver.run_once().unwrap();
        let states = driver.task_states();
        assert!(states.iter().any(|(task, _)| task.starts_with("counts")));
        assert!(states.iter().any(|(task, _)| task.starts_with("resource")));
        assert!(states.iter().all(|(_, state)| *state == TaskState::Done));
    }

    #[test]
    fn foreign_keyspace_is_rejected_at_submit() {
        let queue = Arc::new(RepairQueue::new());
        let session = batch_session(&queue);
        let driver = RepairDriver::new(session, queue.clone());
        let mut log = CommitLog::new("other");
        log.record_count(ConceptId::new(1).unwrap(), 1);
        assert!(matches!(
            driver.submit(log),
            Err(RepairError::KeyspaceMismatch { .. })
        ));
        assert!(queue.is_empty());
    }
}
