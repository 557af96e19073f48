//! File-backed capture of one standard stream with a size-bounding monitor
//!
//! A [`StreamCapture`] owns one backing file playing two roles at once: the
//! child process writes its stream into it (via a duplicated handle passed
//! to `Command::stdout`/`stderr`), and a [`LineReader`] over the same path
//! serves decoded lines to the supervisor. When a size ceiling is configured,
//! a background thread watches the file and performs an *overflow reset* once
//! it grows past 1.5x the budget: both the write handle and the read cursor
//! are rewound to offset 0 and the file is truncated. Unread bytes are gone
//! for good at that point — this trades completeness for a hard bound on
//! disk usage, and the loss is surfaced through [`StreamCapture::lost_bytes`]
//! and a warning log rather than an error.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use procwatch_text::{LineReader, TextError};
use tracing::{debug, warn};

use crate::types::StreamKind;

/// How often the size monitor samples the backing file.
const MONITOR_INTERVAL: Duration = Duration::from_millis(300);

/// One captured stream: write destination for the child, bounded readable
/// buffer for the supervisor, over a single uniquely-named temp file.
#[derive(Debug)]
pub struct StreamCapture {
    path: PathBuf,
    writer: Arc<Mutex<File>>,
    reader: Arc<Mutex<LineReader>>,
    lost_bytes: Arc<AtomicU64>,
    resets: Arc<AtomicU64>,
    monitor: Option<Monitor>,
}

#[derive(Debug)]
struct Monitor {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamCapture {
    /// Create a capture for `kind`, backed by a fresh temp file named after
    /// `label`. A positive `max_size` (bytes) starts the background size
    /// monitor; `None` disables bounding entirely.
    pub fn new(label: &str, kind: StreamKind, max_size: Option<u64>) -> std::io::Result<Self> {
        let (file, path) = tempfile::Builder::new()
            .prefix(&format!("{label}."))
            .suffix(kind.file_suffix())
            .tempfile()?
            .keep()
            .map_err(|e| e.error)?;

        let writer = Arc::new(Mutex::new(file));
        let reader = Arc::new(Mutex::new(LineReader::new(&path)?));
        let lost_bytes = Arc::new(AtomicU64::new(0));
        let resets = Arc::new(AtomicU64::new(0));

        let monitor = match max_size {
            Some(max) if max > 0 => {
                let (stop, stop_rx) = mpsc::channel();
                let handle = thread::Builder::new()
                    .name(format!("{label}-{}-size-monitor", kind.label()))
                    .spawn({
                        let path = path.clone();
                        let writer = Arc::clone(&writer);
                        let reader = Arc::clone(&reader);
                        let lost_bytes = Arc::clone(&lost_bytes);
                        let resets = Arc::clone(&resets);
                        move || monitor_loop(&path, &writer, &reader, &lost_bytes, &resets, max, &stop_rx)
                    })?;
                Some(Monitor { stop, handle })
            }
            _ => None,
        };

        Ok(Self {
            path,
            writer,
            reader,
            lost_bytes,
            resets,
            monitor,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Duplicate the write handle for binding to the child's stdout/stderr.
    ///
    /// The duplicate shares the file offset with the handle the monitor
    /// seeks, so an overflow reset rewinds the child's write position too.
    pub fn write_handle(&self) -> std::io::Result<File> {
        self.writer
            .lock()
            .expect("capture writer mutex poisoned")
            .try_clone()
    }

    /// Read up to `limit` decoded lines from the unread portion of the
    /// stream. See [`LineReader::read_lines`] for the parameter semantics.
    pub fn pick_lines(
        &self,
        limit: Option<usize>,
        max_line_len: Option<usize>,
        strict: bool,
    ) -> Result<(Vec<String>, u64), TextError> {
        self.reader
            .lock()
            .expect("capture reader mutex poisoned")
            .read_lines(limit, max_line_len, strict)
    }

    /// True iff the read cursor has caught up with the file's current size.
    /// The owning process may still be writing.
    pub fn is_stream_end(&self) -> std::io::Result<bool> {
        self.reader
            .lock()
            .expect("capture reader mutex poisoned")
            .reach_end()
    }

    /// Total unread bytes discarded by overflow resets so far.
    #[must_use]
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes.load(Ordering::Relaxed)
    }

    /// Number of overflow resets performed so far.
    #[must_use]
    pub fn overflow_resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Remove the backing file. Safe to call when it is already gone.
    pub fn delete_file(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            // The monitor also exits on a disconnected channel, so a failed
            // send still shuts it down.
            let _ = monitor.stop.send(());
            let _ = monitor.handle.join();
        }
    }
}

fn monitor_loop(
    path: &Path,
    writer: &Mutex<File>,
    reader: &Mutex<LineReader>,
    lost_bytes: &AtomicU64,
    resets: &AtomicU64,
    max_size: u64,
    stop: &mpsc::Receiver<()>,
) {
    loop {
        match stop.recv_timeout(MONITOR_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "size monitor could not stat backing file");
                continue;
            }
        };

        // Reset once the file is beyond 1.5x its budget.
        if size.saturating_sub(max_size) <= max_size / 2 {
            continue;
        }

        warn!(
            path = %path.display(),
            size,
            max_size,
            "output file beyond size budget, clearing file and rewinding cursors"
        );

        // Writer first, then reader: the only place both locks are held.
        // The control thread takes at most the reader lock, so the order
        // cannot deadlock, and no read can interleave with the truncation.
        let mut writer = writer.lock().expect("capture writer mutex poisoned");
        let mut reader = reader.lock().expect("capture reader mutex poisoned");

        let unread = size.saturating_sub(reader.cursor());
        if let Err(e) = reset_write_handle(&mut writer) {
            warn!(path = %path.display(), error = %e, "failed to truncate backing file");
            continue;
        }
        if let Err(e) = reader.rewind() {
            warn!(path = %path.display(), error = %e, "failed to rewind reader after truncation");
        }

        lost_bytes.fetch_add(unread, Ordering::Relaxed);
        resets.fetch_add(1, Ordering::Relaxed);
    }
}

fn reset_write_handle(writer: &mut File) -> std::io::Result<()> {
    writer.seek(SeekFrom::Start(0))?;
    writer.set_len(0)?;
    writer.flush()
}
