//! Core domain types for crawlbatch jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// WorkUnit / ResultRecord
// ---------------------------------------------------------------------------

/// One dispatchable group: a key and the member ids that share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Distinct group key (first input column).
    pub group_key: String,
    /// Member ids in encountered order, duplicates retained.
    pub member_ids: Vec<String>,
    /// Ordinal of the group in first-appearance order.
    pub position: usize,
}

/// A result record returned by the remote executor.
///
/// Scalar cells may arrive as strings or numbers; both are kept as text.
/// Fields the executor sends beyond the known columns are preserved in
/// [`ResultRecord::extra`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "Case", default, deserialize_with = "text_cell")]
    pub case: String,
    #[serde(rename = "Section", default, deserialize_with = "text_cell")]
    pub section: String,
    #[serde(rename = "Theme", default, deserialize_with = "text_cell")]
    pub theme: String,
    #[serde(rename = "Position", default, deserialize_with = "text_cell")]
    pub position: String,
    #[serde(rename = "Title", default, deserialize_with = "text_cell")]
    pub title: String,
    /// Member id that produced the record, when known.
    #[serde(
        rename = "Blog ID",
        alias = "memberId",
        alias = "member_id",
        default,
        deserialize_with = "opt_text_cell",
        skip_serializing_if = "Option::is_none"
    )]
    pub member_id: Option<String>,
    /// Group key of the unit that produced the record (set by the runner).
    #[serde(default, alias = "keyword")]
    pub group_key: String,
    /// All member ids of the producing unit (set by the runner).
    #[serde(
        default,
        rename = "blogIds",
        alias = "member_ids",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub member_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn cell_to_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn text_cell<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(cell_to_text(value).unwrap_or_default())
}

fn opt_text_cell<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(cell_to_text(value))
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// In-memory state of one job: its units, accumulated results and checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Ordered work units.
    pub units: Vec<WorkUnit>,
    /// Records accumulated so far, per group key.
    pub accumulated: BTreeMap<String, Vec<ResultRecord>>,
    /// Index of the next unit to process.
    pub checkpoint: usize,
    pub status: JobStatus,
}

impl JobState {
    /// Fresh state for the given units: nothing accumulated, checkpoint 0.
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }

    /// Total number of records across all groups.
    pub fn record_count(&self) -> usize {
        self.accumulated.values().map(Vec::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Stored jobs
// ---------------------------------------------------------------------------

/// Listing entry for an imported job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub file_name: String,
    pub timestamp: DateTime<Utc>,
}

/// An imported job: the raw rows as uploaded, header included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    pub id: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub rows: Vec<Vec<String>>,
}
