//! Bridge between the aggregator's report channel and a report writer.
//!
//! A failed write is a dropped report, logged and never retried: liveness
//! over delivery guarantees.

pub mod writer;

pub use writer::{JsonLinesWriter, ReportWriter, WriteError};

use crate::domain::Report;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("sender already started")]
    AlreadyStarted,
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Consumes completed reports and forwards them to a [`ReportWriter`].
pub struct Sender {
    inner: tokio::sync::Mutex<Option<Running>>,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawns the forwarding task. Errors with `AlreadyStarted` while
    /// running.
    pub async fn start(
        &self,
        reports: mpsc::Receiver<Report>,
        writer: Arc<dyn ReportWriter>,
        shutdown: CancellationToken,
    ) -> Result<(), SenderError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Err(SenderError::AlreadyStarted);
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_send_loop(reports, writer, stop.clone(), shutdown));
        *inner = Some(Running { stop, task });
        Ok(())
    }

    /// Stops the forwarding task. Idempotent.
    pub async fn stop(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            let _ = running.task.await;
        }
    }
}

async fn run_send_loop(
    mut reports: mpsc::Receiver<Report>,
    writer: Arc<dyn ReportWriter>,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        let report = tokio::select! {
            _ = stop.cancelled() => break,
            _ = shutdown.cancelled() => break,
            report = reports.recv() => match report {
                Some(report) => report,
                None => {
                    debug!("report channel closed; stopping sender");
                    break;
                }
            },
        };
        match writer.write(&report) {
            Ok(()) => debug!(
                buckets = report.buckets.len(),
                queries = report.total_count(),
                "report written"
            ),
            Err(err) => warn!(error = %err, "report lost"),
        }
    }
}
