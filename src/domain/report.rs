use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregated statistics for one query class within a report window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryBucket {
    /// Namespace the class belongs to (`database.collection`).
    pub ns: String,
    /// Operation name (`find`, `update`, `getMore`, ...).
    pub operation: String,
    /// Shape fingerprint grouping structurally identical queries.
    pub fingerprint: String,
    pub count: u64,
    /// Cumulative execution time across all occurrences.
    pub total_time_ms: u64,
    pub min_time_ms: u64,
    pub max_time_ms: u64,
    pub keys_examined: u64,
    pub docs_examined: u64,
    pub docs_returned: u64,
    pub response_bytes: u64,
    /// One sample query from the class, truncated to the configured length.
    pub example: String,
}

/// One aggregation window's worth of per-query-class statistics.
///
/// Buckets are sorted descending by cumulative query time. Immutable once
/// built; consumed exactly once by the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub buckets: Vec<QueryBucket>,
}

impl Report {
    /// Total number of profiled operations covered by this report.
    pub fn total_count(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}
