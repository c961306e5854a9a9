//! Graph configuration, persisted as TOML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::Vertex;

/// How the resolver picks the vertex that survives a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SurvivorPolicy {
    /// Keep the vertex with the smallest concept id.
    #[default]
    LowestId,
    /// Keep the vertex with the largest concept id.
    HighestId,
}

impl SurvivorPolicy {
    /// Pick the survivor from a live set. `None` only for an empty set.
    pub fn choose<'a>(&self, live: &'a [Vertex]) -> Option<&'a Vertex> {
        match self {
            SurvivorPolicy::LowestId => live.iter().min_by_key(|v| v.id),
            SurvivorPolicy::HighestId => live.iter().max_by_key(|v| v.id),
        }
    }
}

/// Settings for the repair driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Attempts per task before it fails with `RetriesExhausted`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff step between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Repair independent indices on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
}

fn default_max_retries() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    50
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            parallel: false,
        }
    }
}

/// Per-graph configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Name of the graph; stamped on every commit log.
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    /// Skip inline checks and defer them to the repair pass.
    #[serde(default)]
    pub batch: bool,
    /// Directory for the durable store. `None` keeps everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Instances per shard before a concept gets a new one.
    #[serde(default = "default_shard_threshold")]
    pub shard_threshold: u64,
    #[serde(default)]
    pub survivor_policy: SurvivorPolicy,
    /// Upper bound on incident edges of an instance, checked inline in normal mode.
    #[serde(default)]
    pub max_vertex_degree: Option<usize>,
    /// Times a merge or shard re-evaluates after losing a write race.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: usize,
    #[serde(default)]
    pub repair: RepairConfig,
}

fn default_keyspace() -> String {
    "grakn".into()
}
fn default_shard_threshold() -> u64 {
    10_000
}
fn default_max_conflict_retries() -> usize {
    8
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            keyspace: default_keyspace(),
            batch: false,
            data_dir: None,
            shard_threshold: default_shard_threshold(),
            survivor_policy: SurvivorPolicy::default(),
            max_vertex_degree: None,
            max_conflict_retries: default_max_conflict_retries(),
            repair: RepairConfig::default(),
        }
    }
}

impl GraphConfig {
    /// In-memory config for the given keyspace.
    pub fn in_memory(keyspace: &str) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            ..Default::default()
        }
    }

    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_shard_threshold(mut self, threshold: u64) -> Self {
        self.shard_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keyspace.is_empty() {
            return Err(ConfigError::Invalid {
                message: "keyspace must not be empty".into(),
            });
        }
        if self.shard_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "shard_threshold must be at least 1".into(),
            });
        }
        if self.max_vertex_degree == Some(0) {
            return Err(ConfigError::Invalid {
                message: "max_vertex_degree must be at least 1 when set".into(),
            });
        }
        if self.repair.max_retries == 0 {
            return Err(ConfigError::Invalid {
                message: "repair.max_retries must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}
