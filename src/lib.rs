// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # akh-batchgraph
//!
//! A transactional graph store with a batch loading mode and the repair pass
//! that brings a batch-loaded graph back to its invariants.
//!
//! ## Architecture
//!
//! - **Registry** (`registry`): type label ↔ graph-local id, root type handles
//! - **Counts** (`counts`): durable per-concept instance counters
//! - **Sharding** (`shard`): extra shard vertices for high fan-out concepts
//! - **Resolver** (`resolve`): merges resources that share a (type, value) index
//! - **Commit** (`commit`, `commit_log`): inline validation or deferred repair logs
//! - **Repair** (`repair`): queue, retry and cancellation around the repair operations
//! - **Storage** (`store`): in-memory maps or redb, behind atomic write batches
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use akh_batchgraph::concept::DataType;
//! use akh_batchgraph::config::GraphConfig;
//! use akh_batchgraph::repair::{RepairDriver, RepairQueue};
//! use akh_batchgraph::session::Session;
//!
//! let queue = Arc::new(RepairQueue::new());
//! let config = GraphConfig::in_memory("mail").with_batch(true);
//! let session = Session::open(config, queue.clone()).unwrap();
//!
//! let mut graph = session.graph().unwrap();
//! graph.put_resource_type("email", DataType::String).unwrap();
//! graph.put_resource(&"email".into(), "a@example.com").unwrap();
//! graph.commit().unwrap();
//!
//! let stats = RepairDriver::new(session, queue).run_once().unwrap();
//! println!("{stats}");
//! ```

mod commit;
pub mod commit_log;
pub mod concept;
pub mod config;
pub mod counts;
pub mod error;
pub mod graph;
pub mod registry;
pub mod repair;
pub mod resolve;
pub mod schema;
pub mod session;
pub mod shard;
pub mod store;
