//! Bucketing of decoded profile events into periodic query-class reports.
//!
//! Events are grouped by (namespace, operation, shape fingerprint) within a
//! time window; a flush task emits one [`Report`] per window over a bounded
//! channel, buckets sorted descending by cumulative query time.

use crate::domain::{Document, ProfileEvent, QueryBucket, Report};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("aggregator already started")]
    AlreadyStarted,
    #[error("aggregator is not running")]
    NotRunning,
}

/// Consumer side of the aggregation contract: accepts one decoded event,
/// failing non-fatally (the caller logs and moves on).
pub trait Aggregator: Send + Sync {
    fn add(&self, event: ProfileEvent) -> Result<(), AggregateError>;
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Cadence at which completed windows are turned into reports.
    pub report_interval: Duration,
    /// Byte cap for the example query stored per bucket.
    pub max_query_length: usize,
    pub report_channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(60),
            max_query_length: 2048,
            report_channel_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct BucketKey {
    ns: String,
    operation: String,
    fingerprint: String,
}

impl BucketKey {
    fn classify(event: &ProfileEvent) -> Self {
        // The wire convention puts the operation name first in the command
        // document; key order is preserved through decoding.
        let operation = event
            .command
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| event.op_type.clone());
        Self {
            ns: event.ns.clone(),
            operation,
            fingerprint: fingerprint(event),
        }
    }
}

/// Structural fingerprint: the sorted top-level keys of the query shape.
/// Sorting is only for grouping; the stored documents keep their order.
fn fingerprint(event: &ProfileEvent) -> String {
    let Some(shape) = query_shape(event) else {
        return String::new();
    };
    let mut keys: Vec<&str> = shape.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys.join(",")
}

fn query_shape(event: &ProfileEvent) -> Option<&Document> {
    for field in ["filter", "query", "q"] {
        if let Some(shape) = event.command.get(field).and_then(|v| v.as_object()) {
            return Some(shape);
        }
    }
    event.update_obj.as_ref()
}

#[derive(Debug, Default)]
struct BucketStats {
    count: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
    keys_examined: u64,
    docs_examined: u64,
    docs_returned: u64,
    response_bytes: u64,
    example: String,
}

struct Window {
    start: DateTime<Utc>,
    buckets: HashMap<BucketKey, BucketStats>,
}

struct AggShared {
    max_query_length: usize,
    window: Mutex<Option<Window>>,
}

impl AggShared {
    /// Swap the current window for a fresh one and build its report.
    /// `None` when the window was empty (no report for empty windows).
    fn drain(&self, now: DateTime<Utc>) -> Option<Report> {
        let mut guard = self.window.lock();
        let window = guard.as_mut()?;
        if window.buckets.is_empty() {
            window.start = now;
            return None;
        }
        let buckets = std::mem::take(&mut window.buckets);
        let start = std::mem::replace(&mut window.start, now);
        Some(build_report(start, now, buckets))
    }

    /// Terminal drain: close the window so later `add` calls fail.
    fn drain_final(&self, now: DateTime<Utc>) -> Option<Report> {
        let window = self.window.lock().take()?;
        if window.buckets.is_empty() {
            return None;
        }
        Some(build_report(window.start, now, window.buckets))
    }
}

fn build_report(
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    buckets: HashMap<BucketKey, BucketStats>,
) -> Report {
    let mut buckets: Vec<QueryBucket> = buckets
        .into_iter()
        .map(|(key, stats)| QueryBucket {
            ns: key.ns,
            operation: key.operation,
            fingerprint: key.fingerprint,
            count: stats.count,
            total_time_ms: stats.total_ms,
            min_time_ms: stats.min_ms,
            max_time_ms: stats.max_ms,
            keys_examined: stats.keys_examined,
            docs_examined: stats.docs_examined,
            docs_returned: stats.docs_returned,
            response_bytes: stats.response_bytes,
            example: stats.example,
        })
        .collect();
    buckets.sort_by(|a, b| b.total_time_ms.cmp(&a.total_time_ms));
    Report {
        start_ts,
        end_ts,
        buckets,
    }
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Windowed query-class aggregator with a Start/Stop lifecycle.
pub struct QueryAggregator {
    config: AggregatorConfig,
    shared: Arc<AggShared>,
    inner: tokio::sync::Mutex<Option<Running>>,
}

impl QueryAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let shared = Arc::new(AggShared {
            max_query_length: config.max_query_length,
            window: Mutex::new(None),
        });
        Self {
            config,
            shared,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens the aggregation window and spawns the flush task. Returns the
    /// report channel. Errors with `AlreadyStarted` while running.
    pub async fn start(&self) -> Result<mpsc::Receiver<Report>, AggregateError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Err(AggregateError::AlreadyStarted);
        }

        *self.shared.window.lock() = Some(Window {
            start: Utc::now(),
            buckets: HashMap::new(),
        });

        let (tx, rx) = mpsc::channel(self.config.report_channel_capacity);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_flush_loop(
            self.shared.clone(),
            tx,
            self.config.report_interval,
            stop.clone(),
        ));
        *inner = Some(Running { stop, task });
        Ok(rx)
    }

    /// Flushes the final window and closes the report channel. Idempotent.
    pub async fn stop(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            let _ = running.task.await;
            // The flush task closes the window on its way out; make sure it
            // is closed even when the task bailed on a dropped consumer.
            let _ = self.shared.window.lock().take();
        }
    }
}

impl Aggregator for QueryAggregator {
    fn add(&self, event: ProfileEvent) -> Result<(), AggregateError> {
        let mut guard = self.shared.window.lock();
        let window = guard.as_mut().ok_or(AggregateError::NotRunning)?;

        let key = BucketKey::classify(&event);
        let duration_ms = event.duration.as_millis() as u64;
        let stats = window.buckets.entry(key).or_default();

        stats.count += 1;
        stats.total_ms += duration_ms;
        stats.max_ms = stats.max_ms.max(duration_ms);
        stats.min_ms = if stats.count == 1 {
            duration_ms
        } else {
            stats.min_ms.min(duration_ms)
        };
        stats.keys_examined += event.keys_examined.max(0) as u64;
        stats.docs_examined += event.docs_examined.max(0) as u64;
        stats.docs_returned += event.nreturned.max(0) as u64;
        stats.response_bytes += event.response_length.max(0) as u64;

        if stats.example.is_empty() {
            let rendered = serde_json::to_string(&event.command).unwrap_or_default();
            stats.example = truncate_on_boundary(rendered, self.shared.max_query_length);
        }
        Ok(())
    }
}

async fn run_flush_loop(
    shared: Arc<AggShared>,
    tx: mpsc::Sender<Report>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(report) = shared.drain(Utc::now()) {
                    if tx.send(report).await.is_err() {
                        debug!("report channel closed; stopping flush loop");
                        return;
                    }
                }
            }
        }
    }

    if let Some(report) = shared.drain_final(Utc::now()) {
        let _ = tx.try_send(report);
    }
}

fn truncate_on_boundary(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(ns: &str, filter: serde_json::Value, ms: u64) -> ProfileEvent {
        let command = json!({"find": "coll", "filter": filter});
        let serde_json::Value::Object(command) = command else {
            unreachable!()
        };
        ProfileEvent {
            ns: ns.to_string(),
            op_type: "command".to_string(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(ms),
            command,
            originating_command: None,
            update_obj: None,
            plan_summary: None,
            keys_examined: 2,
            docs_examined: 4,
            nreturned: 1,
            response_length: 100,
            app_name: None,
            client: None,
        }
    }

    fn idle_config() -> AggregatorConfig {
        AggregatorConfig {
            // Long enough that only stop() flushes during a test.
            report_interval: Duration::from_secs(3600),
            ..AggregatorConfig::default()
        }
    }

    #[tokio::test]
    async fn add_fails_when_not_running() {
        let agg = QueryAggregator::new(idle_config());
        assert!(matches!(
            agg.add(event("a.b", json!({"x": 1}), 5)),
            Err(AggregateError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let agg = QueryAggregator::new(idle_config());
        let _rx = agg.start().await.unwrap();
        assert!(matches!(
            agg.start().await,
            Err(AggregateError::AlreadyStarted)
        ));
        agg.stop().await;
    }

    #[tokio::test]
    async fn groups_structurally_identical_queries() {
        let agg = QueryAggregator::new(idle_config());
        let mut rx = agg.start().await.unwrap();

        agg.add(event("shop.orders", json!({"user_id": 1}), 10)).unwrap();
        agg.add(event("shop.orders", json!({"user_id": 2}), 30)).unwrap();
        agg.add(event("shop.orders", json!({"status": "open"}), 5)).unwrap();
        agg.stop().await;

        let report = rx.recv().await.expect("final report");
        assert!(rx.recv().await.is_none(), "channel closes after stop");

        assert_eq!(report.buckets.len(), 2);
        assert_eq!(report.total_count(), 3);

        // Sorted descending by cumulative time: the user_id class (40ms)
        // comes before the status class (5ms).
        assert_eq!(report.buckets[0].fingerprint, "user_id");
        assert_eq!(report.buckets[0].count, 2);
        assert_eq!(report.buckets[0].total_time_ms, 40);
        assert_eq!(report.buckets[0].min_time_ms, 10);
        assert_eq!(report.buckets[0].max_time_ms, 30);
        assert_eq!(report.buckets[1].fingerprint, "status");
    }

    #[tokio::test]
    async fn add_fails_after_stop() {
        let agg = QueryAggregator::new(idle_config());
        let _rx = agg.start().await.unwrap();
        agg.stop().await;
        assert!(matches!(
            agg.add(event("a.b", json!({"x": 1}), 5)),
            Err(AggregateError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn periodic_flush_emits_reports() {
        let agg = QueryAggregator::new(AggregatorConfig {
            report_interval: Duration::from_millis(50),
            ..AggregatorConfig::default()
        });
        let mut rx = agg.start().await.unwrap();

        agg.add(event("a.b", json!({"k": 1}), 7)).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("flush within interval")
            .expect("report");
        assert_eq!(report.total_count(), 1);
        assert!(report.start_ts <= report.end_ts);

        agg.stop().await;
    }

    #[tokio::test]
    async fn example_query_is_truncated() {
        let agg = QueryAggregator::new(AggregatorConfig {
            report_interval: Duration::from_secs(3600),
            max_query_length: 16,
            ..AggregatorConfig::default()
        });
        let mut rx = agg.start().await.unwrap();

        agg.add(event("a.b", json!({"padding": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}), 3))
            .unwrap();
        agg.stop().await;

        let report = rx.recv().await.expect("final report");
        let example = &report.buckets[0].example;
        assert!(example.len() <= 16 + 3, "example too long: {example}");
        assert!(example.ends_with("..."));
    }
}
