//! Lifecycle wrapper around the reader + decoder pair.
//!
//! `start` opens the log file, spawns the read-and-decode task, and hands
//! back a bounded channel of decoded records. The channel is the pipeline's
//! single backpressure point: a slow consumer stalls the producer rather
//! than dropping lines.

use crate::decoder::SlowQueryDecoder;
use crate::domain::DecodedRecord;
use crate::reader::{ContinuousFileReader, ReaderHandle, ReaderMetrics};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("collector already started")]
    AlreadyStarted,
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub log_path: PathBuf,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl CollectorConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

struct Running {
    stop: CancellationToken,
    reader: ReaderHandle,
    task: JoinHandle<()>,
}

/// Owns the reader + decoder task as a restartable service with explicit
/// Start/Stop semantics.
pub struct Collector {
    config: CollectorConfig,
    inner: tokio::sync::Mutex<Option<Running>>,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens the log file and spawns the read-and-decode task.
    ///
    /// The successful open is the readiness barrier: transient I/O after
    /// this point is retried inside the reader, while an unopenable path
    /// fails `start` outright instead of leaving a silently idle collector.
    /// Errors with `AlreadyStarted` while running.
    pub async fn start(
        &self,
        shutdown: CancellationToken,
    ) -> Result<mpsc::Receiver<DecodedRecord>, CollectorError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Err(CollectorError::AlreadyStarted);
        }

        let reader = ContinuousFileReader::open(&self.config.log_path, self.config.poll_interval)
            .await
            .map_err(|source| CollectorError::Open {
                path: self.config.log_path.clone(),
                source,
            })?;
        let handle = reader.handle();

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_read_loop(reader, tx, stop.clone(), shutdown));

        info!(path = %self.config.log_path.display(), "collector started");
        *inner = Some(Running {
            stop,
            reader: handle,
            task,
        });
        Ok(rx)
    }

    /// Stops the read task and closes the output channel (the producer half
    /// drops once the task has finished). Idempotent.
    pub async fn stop(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            running.reader.close();
            let _ = running.task.await;
            info!("collector stopped");
        }
    }

    /// Reader position snapshot, `None` when not running or already closed.
    pub async fn metrics(&self) -> Option<ReaderMetrics> {
        self.inner
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.reader.metrics())
    }
}

async fn run_read_loop(
    mut reader: ContinuousFileReader,
    tx: mpsc::Sender<DecodedRecord>,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    let decoder = SlowQueryDecoder::new();
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            _ = shutdown.cancelled() => break,
            line = reader.next_line() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let record = decoder.decode(&line);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = shutdown.cancelled() => break,
            sent = tx.send(record) => {
                if sent.is_err() {
                    debug!("output channel closed; stopping collection");
                    break;
                }
            }
        }
    }
}
