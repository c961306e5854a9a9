//! Sessions: one open graph plus everything scoped to it.
//!
//! A session owns the store, the type registry, the configuration and the
//! sink that receives commit logs. Graph handles are opened from it; closing
//! the session rolls back every handle still pending against it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::commit_log::CommitLogSink;
use crate::config::GraphConfig;
use crate::counts::ConceptCountTracker;
use crate::error::{GraphResult, SessionError};
use crate::graph::Graph;
use crate::registry::TypeIdRegistry;
use crate::resolve::DuplicateResourceResolver;
use crate::schema;
use crate::shard::ShardingEngine;
use crate::store::{DurableGraphStore, GraphStore, MemGraphStore};

struct SessionInner {
    config: GraphConfig,
    store: Arc<dyn GraphStore>,
    registry: TypeIdRegistry,
    sink: Arc<dyn CommitLogSink>,
    open: AtomicBool,
    pending: AtomicUsize,
}

/// Shared handle to an open graph. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open the graph described by `config`.
    ///
    /// With a `data_dir` the graph lives in redb under that directory;
    /// otherwise it is in memory and vanishes with the session.
    pub fn open(config: GraphConfig, sink: Arc<dyn CommitLogSink>) -> GraphResult<Self> {
        config.validate()?;
        let store: Arc<dyn GraphStore> = match &config.data_dir {
            Some(dir) => Arc::new(DurableGraphStore::open(dir)?),
            None => Arc::new(MemGraphStore::new()),
        };
        Self::open_with_store(config, store, sink)
    }

    /// Open a session over an existing store.
    pub fn open_with_store(
        config: GraphConfig,
        store: Arc<dyn GraphStore>,
        sink: Arc<dyn CommitLogSink>,
    ) -> GraphResult<Self> {
        config.validate()?;
        schema::bootstrap_meta(store.as_ref())?;
        let registry = TypeIdRegistry::restore(store.as_ref())?;
        tracing::info!(
            keyspace = %config.keyspace,
            batch = config.batch,
            types = registry.len(),
            durable = config.data_dir.is_some(),
            "opened session"
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                store,
                registry,
                sink,
                open: AtomicBool::new(true),
                pending: AtomicUsize::new(0),
            }),
        })
    }

    /// Open a transaction-scoped graph handle.
    pub fn graph(&self) -> GraphResult<Graph> {
        self.ensure_open()?;
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Ok(Graph::new(self.clone()))
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub fn keyspace(&self) -> &str {
        &self.inner.config.keyspace
    }

    pub fn is_batch(&self) -> bool {
        self.inner.config.batch
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &TypeIdRegistry {
        &self.inner.registry
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Graph handles opened and not yet committed or rolled back.
    pub fn pending_transactions(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn counts(&self) -> ConceptCountTracker {
        ConceptCountTracker::new(self.inner.store.clone())
    }

    pub fn resolver(&self) -> DuplicateResourceResolver {
        let config = &self.inner.config;
        DuplicateResourceResolver::new(
            self.inner.store.clone(),
            config.survivor_policy,
            config.max_conflict_retries,
        )
    }

    pub fn sharding(&self) -> ShardingEngine {
        let config = &self.inner.config;
        ShardingEngine::new(
            self.inner.store.clone(),
            config.shard_threshold,
            config.max_conflict_retries,
        )
    }

    /// Release the session.
    ///
    /// Handles still pending can no longer commit; their writes are dropped.
    /// A second call fails with [`SessionError::AlreadyClosed`].
    pub fn close(&self) -> GraphResult<()> {
        if self
            .inner
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyClosed {
                keyspace: self.keyspace().to_string(),
            }
            .into());
        }
        let pending = self.pending_transactions();
        if pending > 0 {
            tracing::warn!(keyspace = %self.keyspace(), pending, "closing session with pending transactions, rolling back");
        }
        tracing::info!(keyspace = %self.keyspace(), "closed session");
        Ok(())
    }

    /// Destroy every vertex, edge and counter of the graph, then close.
    ///
    /// Must not race with other transactions on the same graph.
    pub fn delete(&self) -> GraphResult<()> {
        self.ensure_open()?;
        self.inner.store.clear()?;
        tracing::warn!(keyspace = %self.keyspace(), "deleted graph");
        self.close()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::Closed {
                keyspace: self.keyspace().to_string(),
            })
        }
    }

    pub(crate) fn sink(&self) -> &Arc<dyn CommitLogSink> {
        &self.inner.sink
    }

    pub(crate) fn transaction_finished(&self) {
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("keyspace", &self.keyspace())
            .field("batch", &self.is_batch())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
