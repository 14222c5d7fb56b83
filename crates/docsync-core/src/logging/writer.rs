//! Destinations for JSONL log entries.
//!
//! Each instance writes to its own append-only file, so several replicas in
//! one process (or several processes) never interleave partial lines.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

/// Where a [`JsonlLayer`](super::JsonlLayer) sends its entries
pub trait LogSink: Send + Sync + 'static {
    /// Instance name stamped on every entry
    fn instance(&self) -> &str;

    /// Store one entry
    fn write(&self, entry: &JsonLogEntry) -> io::Result<()>;
}

/// Writer that appends log entries to a JSONL file.
///
/// Each instance gets its own file: `logs/2026-01-21_replica-1.jsonl`
pub struct InstanceLogWriter {
    instance: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl InstanceLogWriter {
    /// Create a new log writer for an instance, creating `logs_dir` if needed.
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> io::Result<Self> {
        let instance = instance.into();
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, instance));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Get the path to the JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush any buffered data to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl LogSink for InstanceLogWriter {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn write(&self, entry: &JsonLogEntry) -> io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }
}

impl Drop for InstanceLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// In-memory sink, mostly for asserting on what was logged
#[derive(Debug, Default)]
pub struct MemorySink {
    instance: String,
    entries: Mutex<Vec<JsonLogEntry>>,
}

impl MemorySink {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Entries at `level` ("error", "warn", ...)
    pub fn entries_at(&self, level: &str) -> Vec<JsonLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.level == level)
            .cloned()
            .collect()
    }

    /// Whether an entry at `level` has a message containing `needle`
    pub fn contains(&self, level: &str, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|entry| entry.level == level && entry.msg.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn instance(&self) -> &str {
        &self.instance
    }

    fn write(&self, entry: &JsonLogEntry) -> io::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}
