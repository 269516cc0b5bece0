//! Output seam for completed reports.

use crate::domain::Report;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

/// Destination for completed reports. A failed write drops the report;
/// the sender never retries.
pub trait ReportWriter: Send + Sync {
    fn write(&self, report: &Report) -> Result<(), WriteError>;
}

/// Writes one JSON object per line to the wrapped output.
pub struct JsonLinesWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl JsonLinesWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl JsonLinesWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> ReportWriter for JsonLinesWriter<W> {
    fn write(&self, report: &Report) -> Result<(), WriteError> {
        let line = serde_json::to_string(report)?;
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}
