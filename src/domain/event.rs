use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ordered key/value document as it appears in the log record.
///
/// Key order is significant for downstream comparison and reporting, so this
/// relies on `serde_json`'s `preserve_order` feature (insertion-ordered map).
pub type Document = serde_json::Map<String, serde_json::Value>;

/// A fully decoded slow-query profiling record.
///
/// This is the canonical representation of one profiled operation throughout
/// the pipeline, from decoder output through to aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEvent {
    /// Namespace the operation ran against (`database.collection`).
    pub ns: String,
    /// Operation type as reported by the server (`command`, `update`, ...).
    pub op_type: String,
    /// Timestamp of the log record (UTC).
    pub timestamp: DateTime<Utc>,
    /// Server-reported execution time.
    pub duration: Duration,
    /// The command document, key order preserved.
    pub command: Document,
    /// For getMore operations, the command that created the cursor.
    #[serde(default)]
    pub originating_command: Option<Document>,
    /// For updates, the update document.
    #[serde(default)]
    pub update_obj: Option<Document>,
    #[serde(default)]
    pub plan_summary: Option<String>,
    #[serde(default)]
    pub keys_examined: i64,
    #[serde(default)]
    pub docs_examined: i64,
    #[serde(default)]
    pub nreturned: i64,
    /// Response length in bytes (`reslen`).
    #[serde(default)]
    pub response_length: i64,
    #[serde(default)]
    pub app_name: Option<String>,
    /// Remote client address, when the server logged one.
    #[serde(default)]
    pub client: Option<String>,
}

/// Why a line produced no usable profiling data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Blank line.
    EmptyLine,
    /// Not a JSON object.
    InvalidJson,
    /// Valid JSON, but not a slow-query record.
    UnexpectedMessage,
    /// Slow-query record whose attribute payload did not decode.
    MalformedAttributes,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyLine => "empty line",
            SkipReason::InvalidJson => "invalid JSON",
            SkipReason::UnexpectedMessage => "unexpected message",
            SkipReason::MalformedAttributes => "malformed attributes",
        }
    }
}

/// Per-line decode result flowing through the collector channel.
///
/// Every input line yields exactly one record: lines that carry no usable
/// profiling data travel as `Skipped` so stream progress stays observable
/// downstream instead of being silently swallowed.
#[derive(Debug, Clone)]
pub enum DecodedRecord {
    Event(Box<ProfileEvent>),
    Skipped(SkipReason),
}

impl DecodedRecord {
    pub fn is_event(&self) -> bool {
        matches!(self, DecodedRecord::Event(_))
    }
}
