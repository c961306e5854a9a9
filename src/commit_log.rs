//! Commit logs: the deferred work a commit hands to the repair pass.
//!
//! A log maps resource indices to the vertices that must be re-checked for
//! duplicates, and concepts to the signed change in their instance count.
//! Logs travel as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::concept::{ConceptId, ResourceIndex};
use crate::error::{CommitError, GraphResult, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLog {
    pub keyspace: String,
    #[serde(default)]
    pub resources: BTreeMap<ResourceIndex, BTreeSet<ConceptId>>,
    #[serde(default)]
    pub concept_counts: BTreeMap<ConceptId, i64>,
}

impl CommitLog {
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            ..Default::default()
        }
    }

    pub fn record_resource(&mut self, index: ResourceIndex, id: ConceptId) {
        self.resources.entry(index).or_default().insert(id);
    }

    /// Add `delta` to a concept's count change; entries that net to zero vanish.
    pub fn record_count(&mut self, concept: ConceptId, delta: i64) {
        let entry = self.concept_counts.entry(concept).or_default();
        *entry += delta;
        if *entry == 0 {
            self.concept_counts.remove(&concept);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.concept_counts.is_empty()
    }

    /// Fold another log of the same keyspace into this one.
    pub fn merge(&mut self, other: CommitLog) {
        for (index, ids) in other.resources {
            self.resources.entry(index).or_default().extend(ids);
        }
        for (concept, delta) in other.concept_counts {
            self.record_count(concept, delta);
        }
    }

    pub fn to_json(&self) -> Result<String, CommitError> {
        serde_json::to_string(self).map_err(|e| CommitError::Log {
            message: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CommitError> {
        serde_json::from_str(json).map_err(|e| CommitError::Log {
            message: e.to_string(),
        })
    }
}

/// Receiver of the logs produced by committing graphs.
pub trait CommitLogSink: Send + Sync {
    fn submit(&self, log: CommitLog) -> GraphResult<()>;
}

/// Sink that drops every log. For graphs whose deferred work is handled elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl CommitLogSink for DiscardSink {
    fn submit(&self, log: CommitLog) -> GraphResult<()> {
        tracing::debug!(keyspace = %log.keyspace, "discarding commit log");
        Ok(())
    }
}

/// Appends logs to a file, one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<std::fs::File>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> GraphResult<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| StoreError::Io { source })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every log in a JSON-lines file. Blank lines are skipped.
    pub fn read_all(path: &Path) -> GraphResult<Vec<CommitLog>> {
        let file = std::fs::File::open(path).map_err(|source| StoreError::Io { source })?;
        let mut logs = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| StoreError::Io { source })?;
            if line.trim().is_empty() {
                continue;
            }
            logs.push(CommitLog::from_json(&line)?);
        }
        Ok(logs)
    }
}

impl CommitLogSink for JsonLinesSink {
    fn submit(&self, log: CommitLog) -> GraphResult<()> {
        let json = log.to_json()?;
        let mut writer = self.writer.lock().map_err(|_| StoreError::Poisoned)?;
        writeln!(writer, "{json}").map_err(|source| StoreError::Io { source })?;
        writer.flush().map_err(|source| StoreError::Io { source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    #[test]
    fn json_uses_flat_field_names() {
        let mut log = CommitLog::new("mail");
        log.record_resource(ResourceIndex::from_raw("RESOURCE-8-a@example.com"), cid(12));
        log.record_count(cid(9), 1);

        let json = log.to_json().unwrap();
        assert!(json.contains("\"keyspace\":\"mail\""));
        assert!(json.contains("\"RESOURCE-8-a@example.com\":[12]"));
        assert!(json.contains("\"concept_counts\":{\"9\":1}"));
        assert_eq!(CommitLog::from_json(&json).unwrap(), log);
    }

    #[test]
    fn counts_that_cancel_out_are_dropped() {
        let mut log = CommitLog::new("mail");
        log.record_count(cid(9), 2);
        log.record_count(cid(9), -2);
        assert!(log.is_empty());
    }

    #[test]
    fn merge_unions_candidates_and_sums_counts() {
        let index = ResourceIndex::from_raw("RESOURCE-8-x");
        let mut a = CommitLog::new("mail");
        a.record_resource(index.clone(), cid(1));
        a.record_count(cid(5), 1);
        let mut b = CommitLog::new("mail");
        b.record_resource(index.clone(), cid(2));
        b.record_count(cid(5), 1);

        a.merge(b);
        assert_eq!(a.resources[&index], BTreeSet::from([cid(1), cid(2)]));
        assert_eq!(a.concept_counts[&cid(5)], 2);
    }

    #[test]
    fn json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.jsonl");
        let sink = JsonLinesSink::open(&path).unwrap();
        let mut log = CommitLog::new("mail");
        log.record_count(cid(3), 4);
        sink.submit(log.clone()).unwrap();
        sink.submit(CommitLog::new("mail")).unwrap();

        let logs = JsonLinesSink::read_all(&path).unwrap();
        assert_eq!(logs, vec![log, CommitLog::new("mail")]);
    }

    #[test]
    fn malformed_log_is_a_log_error() {
        let err = CommitLog::from_json("{not json").unwrap_err();
        assert!(matches!(err, CommitError::Log { .. }));
    }
}
