//! Per-log-file composition of collector and parser.

use crate::aggregator::Aggregator;
use crate::collector::{Collector, CollectorConfig, CollectorError};
use crate::parser::{Parser, ParserError};
use crate::reader::ReaderMetrics;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Parser(#[from] ParserError),
}

/// Composes one collector and one parser over a single monitored log file.
///
/// `start`/`stop` are idempotent. Every successful start is paired with a
/// stop of both sub-components: a failed parser start rolls the collector
/// back, and `stop` always tears down parser then collector.
pub struct Monitor {
    collector: Collector,
    parser: Parser,
    aggregator: Arc<dyn Aggregator>,
    running: tokio::sync::Mutex<bool>,
}

impl Monitor {
    pub fn new(config: CollectorConfig, aggregator: Arc<dyn Aggregator>) -> Self {
        Self {
            collector: Collector::new(config),
            parser: Parser::new(),
            aggregator,
            running: tokio::sync::Mutex::new(false),
        }
    }

    /// Starts the collector, then the parser wired to its output.
    /// A no-op when already running.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        let mut running = self.running.lock().await;
        if *running {
            return Ok(());
        }

        let records = self.collector.start(shutdown.clone()).await?;
        if let Err(err) = self
            .parser
            .start(records, self.aggregator.clone(), shutdown)
            .await
        {
            self.collector.stop().await;
            return Err(err.into());
        }

        *running = true;
        info!("monitor started");
        Ok(())
    }

    /// Stops parser then collector (reverse of start order). Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }
        self.parser.stop().await;
        self.collector.stop().await;
        *running = false;
        info!("monitor stopped");
    }

    /// Reader position snapshot of the underlying collector.
    pub async fn metrics(&self) -> Option<ReaderMetrics> {
        self.collector.metrics().await
    }
}
