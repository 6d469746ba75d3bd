//! Core domain model for harvested product commentary.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "gripe-core";

pub const DEFAULT_RECENCY_DAYS: u32 = 30;

/// Topic manifest driving one harvest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_recency_days")]
    pub recency_days: u32,
    #[serde(default)]
    pub limits: BTreeMap<String, u64>,
    #[serde(default)]
    pub queries: Vec<Topic>,
}

fn default_recency_days() -> u32 {
    DEFAULT_RECENCY_DAYS
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            recency_days: DEFAULT_RECENCY_DAYS,
            limits: BTreeMap::new(),
            queries: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("topic at position {0} has an empty id")]
    EmptyTopicId(usize),
    #[error("duplicate topic id {0:?}")]
    DuplicateTopicId(String),
}

impl Manifest {
    /// Per-source cap from `limits`, falling back to `default` when the key is absent.
    pub fn limit_or(&self, key: &str, default: u64) -> u64 {
        self.limits.get(key).copied().unwrap_or(default)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for (position, topic) in self.queries.iter().enumerate() {
            if topic.id.trim().is_empty() {
                return Err(ManifestError::EmptyTopicId(position));
            }
            if !seen.insert(topic.id.as_str()) {
                return Err(ManifestError::DuplicateTopicId(topic.id.clone()));
            }
        }
        Ok(())
    }
}

/// Named subject area: `include` terms drive source queries, `exclude` terms veto items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Normalized record handed from a connector to the pipeline. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawItem {
    /// Connector-composed id, unique within one source.
    pub external_id: String,
    pub text: String,
    /// Provider engagement count (comment like count); absent for sources without one.
    pub likes: Option<i64>,
    pub published_at: Option<String>,
    pub extra: BTreeMap<String, JsonValue>,
}

/// One accepted item as written into a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredItem {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<i64>,
    pub timestamp: Option<String>,
    pub lang: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Dated result set for one (source, topic) pair. Written once, superseded by the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source: String,
    pub topic_id: String,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<FilteredItem>,
}

/// Persisted pointer structure over the snapshot directory.
///
/// `files` behaves as an insertion-ordered set. `latest` is not re-derived after a
/// retention sweep, so it may name a file that has since been pruned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotIndex {
    #[serde(default)]
    pub latest: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl SnapshotIndex {
    /// Point `latest[topic_id]` at `file_name` and append it to `files` on first sight.
    pub fn record_snapshot(&mut self, topic_id: &str, file_name: &str) {
        self.latest.insert(topic_id.to_string(), file_name.to_string());
        if !self.files.iter().any(|f| f == file_name) {
            self.files.push(file_name.to_string());
        }
    }

    pub fn latest_for(&self, topic_id: &str) -> Option<&str> {
        self.latest.get(topic_id).map(String::as_str)
    }

    /// Keep only the files accepted by `keep`, preserving order and dropping repeats.
    pub fn retain_files(&mut self, mut keep: impl FnMut(&str) -> bool) {
        let mut seen = HashSet::new();
        self.files.retain(|f| keep(f.as_str()) && seen.insert(f.clone()));
    }
}
