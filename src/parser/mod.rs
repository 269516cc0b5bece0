//! Bridge between the collector's record channel and the aggregator.
//!
//! One task drains the channel, forwarding events to the aggregator and
//! counting skipped records. Aggregation failures for a single record are
//! logged and dropped; only shutdown or channel closure ends the task.

use crate::aggregator::Aggregator;
use crate::domain::DecodedRecord;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("parser already started")]
    AlreadyStarted,
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Consumes decoded records and feeds events to the aggregator.
pub struct Parser {
    inner: tokio::sync::Mutex<Option<Running>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawns the consumer task. Errors with `AlreadyStarted` while running.
    pub async fn start(
        &self,
        records: mpsc::Receiver<DecodedRecord>,
        aggregator: Arc<dyn Aggregator>,
        shutdown: CancellationToken,
    ) -> Result<(), ParserError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Err(ParserError::AlreadyStarted);
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_consume_loop(records, aggregator, stop.clone(), shutdown));
        *inner = Some(Running { stop, task });
        Ok(())
    }

    /// Stops the consumer task. Idempotent.
    pub async fn stop(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            let _ = running.task.await;
        }
    }
}

async fn run_consume_loop(
    mut records: mpsc::Receiver<DecodedRecord>,
    aggregator: Arc<dyn Aggregator>,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut skipped: u64 = 0;
    loop {
        let record = tokio::select! {
            _ = stop.cancelled() => break,
            _ = shutdown.cancelled() => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => {
                    debug!("record channel closed; stopping parser");
                    break;
                }
            },
        };
        match record {
            DecodedRecord::Event(event) => {
                if let Err(err) = aggregator.add(*event) {
                    warn!(error = %err, "failed to aggregate event");
                }
            }
            DecodedRecord::Skipped(reason) => {
                skipped += 1;
                trace!(reason = reason.as_str(), total = skipped, "skipped record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregateError;
    use crate::domain::{ProfileEvent, SkipReason};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Capturing fake: records added namespaces, optionally failing.
    struct RecordingAggregator {
        added: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingAggregator {
        fn new(fail: bool) -> Self {
            Self {
                added: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl Aggregator for RecordingAggregator {
        fn add(&self, event: ProfileEvent) -> Result<(), AggregateError> {
            if self.fail {
                return Err(AggregateError::NotRunning);
            }
            self.added.lock().push(event.ns);
            Ok(())
        }
    }

    fn test_event(ns: &str) -> DecodedRecord {
        DecodedRecord::Event(Box::new(ProfileEvent {
            ns: ns.to_string(),
            op_type: "command".to_string(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(1),
            command: serde_json::Map::new(),
            originating_command: None,
            update_obj: None,
            plan_summary: None,
            keys_examined: 0,
            docs_examined: 0,
            nreturned: 0,
            response_length: 0,
            app_name: None,
            client: None,
        }))
    }

    async fn settle(aggregator: &RecordingAggregator, expected: usize) {
        for _ in 0..500 {
            if aggregator.added.lock().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn forwards_events_and_skips_placeholders() {
        let aggregator = Arc::new(RecordingAggregator::new(false));
        let (tx, rx) = mpsc::channel(8);
        let parser = Parser::new();
        parser
            .start(rx, aggregator.clone(), CancellationToken::new())
            .await
            .unwrap();

        tx.send(test_event("a.b")).await.unwrap();
        tx.send(DecodedRecord::Skipped(SkipReason::InvalidJson))
            .await
            .unwrap();
        tx.send(test_event("c.d")).await.unwrap();

        settle(&aggregator, 2).await;
        assert_eq!(*aggregator.added.lock(), vec!["a.b", "c.d"]);

        parser.stop().await;
    }

    #[tokio::test]
    async fn aggregation_errors_do_not_stop_the_stream() {
        let failing = Arc::new(RecordingAggregator::new(true));
        let (tx, rx) = mpsc::channel(8);
        let parser = Parser::new();
        parser
            .start(rx, failing.clone(), CancellationToken::new())
            .await
            .unwrap();

        tx.send(test_event("a.b")).await.unwrap();
        tx.send(test_event("c.d")).await.unwrap();

        // The channel keeps draining despite per-record failures.
        for _ in 0..500 {
            if tx.capacity() == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tx.capacity(), 8);

        parser.stop().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_idempotent() {
        let aggregator = Arc::new(RecordingAggregator::new(false));
        let (_tx, rx) = mpsc::channel(8);
        let (_tx2, rx2) = mpsc::channel(8);

        let parser = Parser::new();
        parser
            .start(rx, aggregator.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            parser
                .start(rx2, aggregator.clone(), CancellationToken::new())
                .await,
            Err(ParserError::AlreadyStarted)
        ));

        parser.stop().await;
        parser.stop().await;
    }

    #[tokio::test]
    async fn closed_input_channel_ends_the_task() {
        let aggregator = Arc::new(RecordingAggregator::new(false));
        let (tx, rx) = mpsc::channel(8);
        let parser = Parser::new();
        parser
            .start(rx, aggregator, CancellationToken::new())
            .await
            .unwrap();

        drop(tx);
        // stop() joins the task; a task stuck on recv would hang here.
        tokio::time::timeout(Duration::from_secs(5), parser.stop())
            .await
            .expect("parser task exited after channel close");
    }
}
