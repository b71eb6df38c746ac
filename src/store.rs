//! Durable storage for face records.
//!
//! The gallery keeps its working set in memory and writes every mutation
//! through a [`RecordStore`] before applying it. [`WalStore`] persists the
//! mutations as newline-delimited JSON and replays them on startup.

use crate::error::StoreError;
use crate::model::FaceRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A single gallery mutation as written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogEntry {
    Upsert { record: FaceRecord },
    Delete { identity: String },
    Rename { from: String, to: String },
}

/// Backing persistence for the gallery.
///
/// Implementations must be safe for concurrent use.
pub trait RecordStore: Send + Sync {
    /// Returns every live record, ordered by identity.
    fn load(&self) -> Result<Vec<FaceRecord>, StoreError>;

    /// Durably records one mutation. Must not return before the entry
    /// would survive a crash.
    fn append(&self, entry: &LogEntry) -> Result<(), StoreError>;

    /// Replaces the stored history with one upsert per live record.
    fn compact(&self, records: &[FaceRecord]) -> Result<(), StoreError>;

    /// Number of entries written since the last compaction.
    fn entry_count(&self) -> usize;
}

/// Applies a sequence of log entries to an empty gallery.
pub fn replay<I>(entries: I) -> BTreeMap<String, FaceRecord>
where
    I: IntoIterator<Item = LogEntry>,
{
    let mut records = BTreeMap::new();
    for entry in entries {
        match entry {
            LogEntry::Upsert { record } => {
                records.insert(record.identity.clone(), record);
            }
            LogEntry::Delete { identity } => {
                records.remove(&identity);
            }
            LogEntry::Rename { from, to } => match records.remove(&from) {
                Some(mut record) => {
                    record.identity = to.clone();
                    records.insert(to, record);
                }
                None => tracing::warn!("Log renames unknown identity {:?}, skipping", from),
            },
        }
    }
    records
}

// ---------------------------------------------------------------------------
// WalStore
// ---------------------------------------------------------------------------

/// Append-only NDJSON log on the local filesystem.
pub struct WalStore {
    path: PathBuf,
    file: Mutex<File>,
    entries: AtomicUsize,
}

impl WalStore {
    /// Opens (or creates) the log at `path`.
    ///
    /// A partial last line left by a crash mid-append is cut off so that new
    /// entries start on a clean line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let content = fs::read(&path)?;
        if !content.is_empty() && !content.ends_with(b"\n") {
            let keep = content
                .iter()
                .rposition(|&b| b == b'\n')
                .map(|pos| pos + 1)
                .unwrap_or(0);
            tracing::warn!(
                "Truncating {} trailing bytes of incomplete entry in {}",
                content.len() - keep,
                path.display()
            );
            file.set_len(keep as u64)?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            entries: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Vec<LogEntry>, StoreError> {
        let content = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(line)
                .map_err(|source| StoreError::Corrupt { line: i + 1, source })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RecordStore for WalStore {
    fn load(&self) -> Result<Vec<FaceRecord>, StoreError> {
        let entries = self.read_entries()?;
        self.entries.store(entries.len(), Ordering::SeqCst);
        Ok(replay(entries).into_values().collect())
    }

    fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        self.entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn compact(&self, records: &[FaceRecord]) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("wal.tmp");

        // Holding the lock keeps appends out until the new file is in place.
        let mut file = self.file.lock();
        let replacement = write_snapshot(&tmp_path, records)
            .and_then(|()| {
                OpenOptions::new()
                    .append(true)
                    .open(&tmp_path)
                    .map_err(StoreError::from)
            })
            .and_then(|appender| {
                fs::rename(&tmp_path, &self.path)?;
                Ok(appender)
            });

        // The append handle follows the inode through the rename, so it is
        // only swapped in once the new log is at `path`.
        match replacement {
            Ok(appender) => *file = appender,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        }
        self.entries.store(records.len(), Ordering::SeqCst);

        tracing::info!(
            "Compacted {} to {} records",
            self.path.display(),
            records.len()
        );
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }
}

fn write_snapshot(path: &Path, records: &[FaceRecord]) -> Result<(), StoreError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        let entry = LogEntry::Upsert { record: record.clone() };
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory [`RecordStore`]. Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    log: Mutex<Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn load(&self) -> Result<Vec<FaceRecord>, StoreError> {
        let log = self.log.lock().clone();
        Ok(replay(log).into_values().collect())
    }

    fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.log.lock().push(entry.clone());
        Ok(())
    }

    fn compact(&self, records: &[FaceRecord]) -> Result<(), StoreError> {
        let mut log = self.log.lock();
        *log = records
            .iter()
            .cloned()
            .map(|record| LogEntry::Upsert { record })
            .collect();
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.log.lock().len()
    }
}
