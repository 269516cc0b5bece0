//! Continuous line reader for a growing, rotating log file.
//!
//! Presents a single logical line stream over a path whose underlying file
//! may be renamed away (rotation) or truncated in place. Rotation is detected
//! by comparing a device+inode identity captured at open time against a fresh
//! stat of the path; truncation by the file size dropping below the consumed
//! position. The old handle is fully drained before the new file is followed,
//! so no data is lost or reordered across a rotation boundary.

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Consecutive missing-stat polls between "still unreadable" warnings.
/// Transient rotation races resolve within a poll or two; anything that
/// stays missing this long is worth surfacing.
const MISSING_WARN_EVERY: u64 = 60;

/// Snapshot of how much of the underlying file has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderMetrics {
    /// Length of the underlying file as of the last stat.
    pub input_size: u64,
    /// Bytes consumed so far.
    pub input_pos: u64,
}

/// Stable identity of the file behind a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
impl FileId {
    fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Non-Unix fallback: no stable identity, rotation detection degrades to
/// size-based truncation detection.
#[cfg(not(unix))]
impl FileId {
    fn of(_meta: &std::fs::Metadata) -> Self {
        Self { dev: 0, ino: 0 }
    }
}

/// Position state shared between the read path and metrics queries.
struct MetricsCell {
    closed: bool,
    size: u64,
    pos: u64,
}

struct Shared {
    cell: Mutex<MetricsCell>,
    closed: CancellationToken,
}

impl Shared {
    fn advance(&self, n: u64, size_hint: Option<u64>) {
        let mut cell = self.cell.lock();
        if cell.closed {
            return;
        }
        cell.pos += n;
        let observed = size_hint.unwrap_or(cell.size);
        cell.size = observed.max(cell.pos);
    }

    fn reset(&self, size: u64) {
        let mut cell = self.cell.lock();
        if cell.closed {
            return;
        }
        cell.pos = 0;
        cell.size = size;
    }

    fn set_size(&self, size: u64) {
        let mut cell = self.cell.lock();
        if cell.closed {
            return;
        }
        cell.size = size.max(cell.pos);
    }

    fn pos(&self) -> u64 {
        self.cell.lock().pos
    }

    fn metrics(&self) -> Option<ReaderMetrics> {
        let cell = self.cell.lock();
        if cell.closed {
            return None;
        }
        Some(ReaderMetrics {
            input_size: cell.size,
            input_pos: cell.pos,
        })
    }

    fn close(&self) {
        self.cell.lock().closed = true;
        self.closed.cancel();
    }
}

/// Cloneable handle for closing the reader and querying its metrics from
/// other tasks while a read is in flight.
#[derive(Clone)]
pub struct ReaderHandle {
    shared: Arc<Shared>,
}

impl ReaderHandle {
    /// Consistent `{input_size, input_pos}` snapshot, `None` once closed.
    pub fn metrics(&self) -> Option<ReaderMetrics> {
        self.shared.metrics()
    }

    /// Marks the reader closed and wakes a blocked `next_line`, which then
    /// returns end-of-stream within one poll interval. Idempotent. The file
    /// handle itself is released when the reader is dropped.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

/// Outcome of one attempt to make progress against the file.
enum Progress {
    /// New bytes were buffered (or a new file was opened); try extracting
    /// a line again without sleeping.
    Read,
    /// Rotation handover: the last unread bytes of the old file, emitted
    /// before switching to the new one.
    FinalFragment(Bytes),
    /// Nothing to do right now; sleep one poll interval.
    Idle,
}

/// Rotation- and truncation-aware infinite line stream over one file path.
///
/// Opened at end-of-file (historical content is not replayed). `next_line`
/// produces complete newline-terminated lines until the reader is closed,
/// retrying transient I/O errors indefinitely at the poll interval.
pub struct ContinuousFileReader {
    path: PathBuf,
    file: fs::File,
    id: FileId,
    buf: Vec<u8>,
    shared: Arc<Shared>,
    poll_interval: Duration,
    missing_polls: u64,
}

impl ContinuousFileReader {
    /// Opens `path` (following symlinks) and seeks to end-of-file.
    pub async fn open(path: impl AsRef<Path>, poll_interval: Duration) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = fs::File::open(&path).await?;
        let meta = file.metadata().await?;
        let pos = file.seek(SeekFrom::End(0)).await?;

        let shared = Arc::new(Shared {
            cell: Mutex::new(MetricsCell {
                closed: false,
                size: pos.max(meta.len()),
                pos,
            }),
            closed: CancellationToken::new(),
        });

        Ok(Self {
            path,
            file,
            id: FileId::of(&meta),
            buf: Vec::new(),
            shared,
            poll_interval,
            missing_polls: 0,
        })
    }

    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle {
            shared: self.shared.clone(),
        }
    }

    /// See [`ReaderHandle::metrics`].
    pub fn metrics(&self) -> Option<ReaderMetrics> {
        self.shared.metrics()
    }

    /// See [`ReaderHandle::close`].
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns the next complete line (trailing newline included), or `None`
    /// once the reader has been closed. Blocks until data arrives, waking on
    /// appends, rotation, truncation, and close.
    pub async fn next_line(&mut self) -> Option<Bytes> {
        loop {
            if self.shared.closed.is_cancelled() {
                return None;
            }
            if let Some(line) = self.take_buffered_line() {
                return Some(line);
            }
            match self.fill().await {
                Progress::Read => {}
                Progress::FinalFragment(line) => return Some(line),
                Progress::Idle => {
                    tokio::select! {
                        _ = self.shared.closed.cancelled() => return None,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    fn take_buffered_line(&mut self) -> Option<Bytes> {
        let nl = self.buf.iter().position(|&b| b == b'\n')?;
        let rest = self.buf.split_off(nl + 1);
        let line = std::mem::replace(&mut self.buf, rest);
        Some(Bytes::from(line))
    }

    async fn fill(&mut self) -> Progress {
        let mut chunk = [0u8; READ_CHUNK];
        match self.file.read(&mut chunk).await {
            Ok(0) => self.check_path().await,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                let size = self.file.metadata().await.map(|m| m.len()).ok();
                self.shared.advance(n as u64, size);
                Progress::Read
            }
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "read failed; retrying");
                Progress::Idle
            }
        }
    }

    /// At EOF on the current handle: re-stat the path (resolving the symlink
    /// target fresh) and decide between rotation, truncation, and waiting.
    async fn check_path(&mut self) -> Progress {
        let meta = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) => {
                self.missing_polls += 1;
                if self.missing_polls % MISSING_WARN_EVERY == 0 {
                    warn!(
                        path = %self.path.display(),
                        polls = self.missing_polls,
                        error = %err,
                        "log file still unreadable"
                    );
                } else {
                    debug!(error = %err, path = %self.path.display(), "stat failed; retrying");
                }
                return Progress::Idle;
            }
        };
        self.missing_polls = 0;

        let current = FileId::of(&meta);
        if current != self.id {
            // The path points at a different file now. The old handle is at
            // EOF, so hand over: emit any buffered partial as a final line,
            // then follow the new file from offset 0.
            if !self.buf.is_empty() {
                let line = Bytes::from(std::mem::take(&mut self.buf));
                return Progress::FinalFragment(line);
            }
            return match fs::File::open(&self.path).await {
                Ok(file) => {
                    info!(path = %self.path.display(), "log file rotated; following new file");
                    self.file = file;
                    self.id = current;
                    self.shared.reset(meta.len());
                    Progress::Read
                }
                Err(err) => {
                    debug!(error = %err, path = %self.path.display(), "rotated file not yet readable; retrying");
                    Progress::Idle
                }
            };
        }

        if meta.len() < self.shared.pos() {
            // Truncated in place. Content before the truncation point is
            // gone, so the buffered partial has no continuation.
            info!(
                path = %self.path.display(),
                consumed = self.shared.pos(),
                new_size = meta.len(),
                "log file truncated; restarting from offset 0"
            );
            self.buf.clear();
            if let Err(err) = self.file.seek(SeekFrom::Start(0)).await {
                debug!(error = %err, "seek after truncation failed; retrying");
                return Progress::Idle;
            }
            self.shared.reset(meta.len());
            return Progress::Read;
        }

        self.shared.set_size(meta.len());
        Progress::Idle
    }
}
