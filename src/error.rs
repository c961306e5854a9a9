//! Rich diagnostic error types for the batch graph store.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. [`GraphError`] wraps them all so the
//! full diagnostic chain reaches the caller.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the batch graph store.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl GraphError {
    /// Whether the failed operation may succeed if the caller retries it.
    ///
    /// Only storage-level conflicts, unavailability and I/O failures qualify;
    /// validation failures and misuse never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Store(e) if e.is_transient())
    }
}

// ---------------------------------------------------------------------------
// Type errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TypeError {
    #[error("type label not found: \"{label}\"")]
    #[diagnostic(
        code(akh::types::label_not_found),
        help(
            "No type with this label was ever created in this graph. \
             Type ids are assigned once at type creation; create the type first \
             or check the label spelling (labels are case-sensitive)."
        )
    )]
    LabelNotFound { label: String },

    #[error("type id {type_id} is not registered")]
    #[diagnostic(
        code(akh::types::id_not_found),
        help("Type ids are graph-local. Make sure the id came from this graph's registry.")
    )]
    IdNotFound { type_id: u32 },

    #[error("type label \"{label}\" is already registered with id {existing_id}")]
    #[diagnostic(
        code(akh::types::duplicate_label),
        help("Type labels are unique per graph. Reuse the existing type or pick a different label.")
    )]
    DuplicateLabel { label: String, existing_id: u32 },

    #[error("type \"{label}\" is a {actual} type, expected a {expected} type")]
    #[diagnostic(
        code(akh::types::wrong_kind),
        help("Instances must be created against a type of the matching kind.")
    )]
    WrongKind {
        label: String,
        expected: String,
        actual: String,
    },

    #[error("meta type \"{label}\" cannot be instantiated or redefined")]
    #[diagnostic(
        code(akh::types::meta_immutable),
        help("The root types are fixed at graph initialization. Create a subtype instead.")
    )]
    MetaImmutable { label: String },

    #[error("value {value} does not match data type {data_type} of \"{label}\"")]
    #[diagnostic(
        code(akh::types::data_type_mismatch),
        help("Resource values must carry the data type declared by their resource type.")
    )]
    DataTypeMismatch {
        label: String,
        data_type: String,
        value: String,
    },

    #[error("type id space exhausted")]
    #[diagnostic(
        code(akh::types::exhausted),
        help("A graph can hold at most u32::MAX types.")
    )]
    IdsExhausted,
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(akh::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb error: {message}")]
    #[diagnostic(
        code(akh::store::redb),
        help(
            "The embedded database reported an error. If this persists across \
             restarts the data file may be damaged."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(akh::store::serde),
        help(
            "Failed to encode or decode a stored record. This usually means the \
             on-disk format changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("{what} {id} not found")]
    #[diagnostic(
        code(akh::store::not_found),
        help("The record does not exist. It may have been deleted or merged by a concurrent writer.")
    )]
    NotFound { what: &'static str, id: u64 },

    #[error("{what} {id} already exists")]
    #[diagnostic(
        code(akh::store::already_exists),
        help("Ids are allocated by the store; do not reuse ids across writes.")
    )]
    AlreadyExists { what: &'static str, id: u64 },

    #[error("write conflict: {reason}")]
    #[diagnostic(
        code(akh::store::conflict),
        help(
            "A concurrent writer changed data this write depended on. \
             Nothing was applied; re-read and retry the operation."
        )
    )]
    Conflict { reason: String },

    #[error("index {index} already holds a live resource")]
    #[diagnostic(
        code(akh::store::index_occupied),
        help("Another writer committed a resource with the same type and value first.")
    )]
    IndexOccupied { index: String },

    #[error("type \"{label}\" (id {type_id}) collides with type vertex {owner}")]
    #[diagnostic(
        code(akh::store::type_taken),
        help(
            "Another session created a type with this label or id first. \
             Reopen the session to pick up its types, then retry."
        )
    )]
    TypeTaken {
        label: String,
        type_id: u32,
        owner: u64,
    },

    #[error("storage unavailable: {message}")]
    #[diagnostic(
        code(akh::store::unavailable),
        help("The storage backend could not serve the request right now. Retry with backoff.")
    )]
    Unavailable { message: String },

    #[error("store lock poisoned")]
    #[diagnostic(
        code(akh::store::poisoned),
        help("A thread panicked while holding the store lock. Reopen the store.")
    )]
    Poisoned,

    #[error("id space exhausted")]
    #[diagnostic(
        code(akh::store::exhausted),
        help("The store cannot allocate more than u64::MAX ids.")
    )]
    IdsExhausted,
}

impl StoreError {
    /// Conflicts, unavailability and I/O failures can be retried; everything
    /// else cannot.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. } | StoreError::Unavailable { .. } | StoreError::Io { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Commit errors
// ---------------------------------------------------------------------------

/// A single inline-validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A resource index holds more than one live vertex.
    DuplicateResource { index: String, existing: u64 },
    /// An instance vertex would exceed the configured degree bound.
    DegreeExceeded {
        concept: u64,
        degree: usize,
        max: usize,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::DuplicateResource { index, existing } => {
                write!(f, "index {index} is already held by concept {existing}")
            }
            Violation::DegreeExceeded {
                concept,
                degree,
                max,
            } => write!(f, "concept {concept} has {degree} edges, bound is {max}"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CommitError {
    #[error("invalid graph: {}", format_violations(.violations))]
    #[diagnostic(
        code(akh::commit::invalid_graph),
        help(
            "The transaction was rolled back because it breaks a graph invariant. \
             Correct the writes and commit again, or load in batch mode to defer \
             the checks to post-processing."
        )
    )]
    InvalidGraph { violations: Vec<Violation> },

    #[error("transaction already finished")]
    #[diagnostic(
        code(akh::commit::finished),
        help("A graph handle commits or rolls back exactly once. Open a new one from the session.")
    )]
    Finished,

    #[error("commit log error: {message}")]
    #[diagnostic(
        code(akh::commit::log),
        help("The commit log could not be encoded, decoded or forwarded.")
    )]
    Log { message: String },

    #[error("transaction committed but its commit log was not delivered")]
    #[diagnostic(
        code(akh::commit::log_undelivered),
        help(
            "The writes are stored; only the log is missing from the sink. \
             Resubmit the carried log once the sink recovers, or the repair pass \
             will never see this transaction."
        )
    )]
    LogUndelivered {
        log: Box<crate::commit_log::CommitLog>,
        #[source]
        source: Box<GraphError>,
    },
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session \"{keyspace}\" is closed")]
    #[diagnostic(
        code(akh::session::closed),
        help("The session was closed or its graph deleted. Open a new session.")
    )]
    Closed { keyspace: String },

    #[error("session \"{keyspace}\" was already closed")]
    #[diagnostic(
        code(akh::session::already_closed),
        help("close_session() may be called exactly once per session.")
    )]
    AlreadyClosed { keyspace: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(akh::config::invalid),
        help("Check the GraphConfig fields. {message}")
    )]
    Invalid { message: String },

    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(akh::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(akh::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(akh::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias for functions returning graph results.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_to_graph_error() {
        let err = StoreError::NotFound {
            what: "vertex",
            id: 7,
        };
        let graph: GraphError = err.into();
        assert!(matches!(
            graph,
            GraphError::Store(StoreError::NotFound { id: 7, .. })
        ));
    }

    #[test]
    fn only_conflicts_and_unavailability_are_transient() {
        let conflict: GraphError = StoreError::Conflict {
            reason: "version moved".into(),
        }
        .into();
        assert!(conflict.is_transient());

        let down: GraphError = StoreError::Unavailable {
            message: "disk busy".into(),
        }
        .into();
        assert!(down.is_transient());

        let invalid: GraphError = CommitError::InvalidGraph { violations: vec![] }.into();
        assert!(!invalid.is_transient());

        let missing: GraphError = TypeError::LabelNotFound {
            label: "email".into(),
        }
        .into();
        assert!(!missing.is_transient());
    }

    #[test]
    fn invalid_graph_lists_every_violation() {
        let err = CommitError::InvalidGraph {
            violations: vec![
                Violation::DuplicateResource {
                    index: "RESOURCE-8-a".into(),
                    existing: 12,
                },
                Violation::DegreeExceeded {
                    concept: 3,
                    degree: 5,
                    max: 4,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("RESOURCE-8-a"));
        assert!(msg.contains("concept 3 has 5 edges"));
    }
}
