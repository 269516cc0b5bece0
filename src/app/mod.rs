//! Application wiring: configuration, logging, and the lifecycle of the
//! aggregator → monitor → sender pipeline.

pub mod config;
pub mod logging;
pub mod shutdown;

pub use config::{Config, ConfigError, LogLevel};

use crate::aggregator::{AggregatorConfig, QueryAggregator};
use crate::collector::CollectorConfig;
use crate::monitor::Monitor;
use crate::sender::{JsonLinesWriter, ReportWriter, Sender};
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Builds the app from CLI/env arguments, honoring `--config-file`.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args(args)?;
        let config = match &config.config_file {
            Some(path) => Config::from_file(path)?,
            None => config,
        };
        Ok(Self::new(config))
    }

    /// Runs the pipeline until a shutdown signal arrives, then tears it
    /// down in reverse start order.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(self.config.log_level);
        info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %self.config.log_file.display(),
            "starting slowlog-monitor"
        );

        let aggregator = Arc::new(QueryAggregator::new(AggregatorConfig {
            report_interval: self.config.report_interval,
            max_query_length: self.config.max_query_length,
            ..AggregatorConfig::default()
        }));
        let reports = aggregator.start().await?;

        let monitor = Monitor::new(
            CollectorConfig {
                log_path: self.config.log_file.clone(),
                poll_interval: self.config.poll_interval,
                channel_capacity: self.config.channel_capacity,
            },
            aggregator.clone(),
        );

        let writer: Arc<dyn ReportWriter> = match &self.config.report_file {
            Some(path) => Arc::new(JsonLinesWriter::create(path).with_context(|| {
                format!("failed to create report file {}", path.display())
            })?),
            None => Arc::new(JsonLinesWriter::stdout()),
        };

        let cancel = CancellationToken::new();
        monitor.start(cancel.clone()).await?;
        let sender = Sender::new();
        sender.start(reports, writer, cancel.clone()).await?;

        shutdown::wait_for_signal().await;

        // Reverse start order. The final aggregation window is flushed on a
        // best-effort basis; shutdown is the only condition under which
        // in-flight data may be dropped.
        cancel.cancel();
        monitor.stop().await;
        aggregator.stop().await;
        sender.stop().await;

        info!("slowlog-monitor stopped");
        Ok(())
    }
}
