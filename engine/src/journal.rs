//! Durable journal behind the event buffer.
//!
//! The journal is a JSON-lines log of buffer changes. A [`BufferSnapshot`]
//! entry describes the whole buffer; `append`, `requeue`, `remove` and
//! `evict` entries describe changes since. Replaying the log from the last snapshot gives
//! back every record that was accepted and not yet acknowledged.
//!
//! Compaction rewrites the log as a single snapshot entry. The file backend
//! writes the new log to a temporary file and renames it over the old one,
//! so a crash during compaction leaves either the old or the new log.

use crate::{error::Result, DeviceId, Error, Record, Sequence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Version of the journal format for future compatibility.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// File name of the journal inside the storage directory.
pub const JOURNAL_FILE_NAME: &str = "buffer.journal";

/// A point-in-time snapshot of the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    /// Journal format version
    pub format_version: u32,
    /// Device the records belong to
    pub device_id: DeviceId,
    /// Highest sequence ever handed out
    pub last_sequence: Sequence,
    /// Records dropped because the buffer was full
    pub dropped: u64,
    /// Unacknowledged records in sequence order
    pub records: Vec<Record>,
    /// Failed send attempts per record, for records that failed at least once
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<Sequence, u32>,
}

impl BufferSnapshot {
    /// Create a new empty snapshot.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            format_version: JOURNAL_FORMAT_VERSION,
            device_id: device_id.into(),
            last_sequence: 0,
            dropped: 0,
            records: Vec::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Apply one journal entry on top of this snapshot.
    pub fn apply(&mut self, entry: JournalEntry) -> Result<()> {
        match entry {
            JournalEntry::Snapshot(snapshot) => {
                if snapshot.format_version > JOURNAL_FORMAT_VERSION {
                    return Err(Error::Storage(format!(
                        "unsupported journal format version: {} (max supported: {})",
                        snapshot.format_version, JOURNAL_FORMAT_VERSION
                    )));
                }
                *self = snapshot;
            }
            JournalEntry::Append { record } => {
                self.last_sequence = self.last_sequence.max(record.sequence);
                self.records.push(record);
            }
            JournalEntry::Requeue { sequences } => {
                for sequence in sequences {
                    if self.records.iter().any(|r| r.sequence == sequence) {
                        *self.failures.entry(sequence).or_default() += 1;
                    }
                }
            }
            JournalEntry::Remove { sequences } => {
                self.records.retain(|r| !sequences.contains(&r.sequence));
                for sequence in &sequences {
                    self.failures.remove(sequence);
                }
            }
            JournalEntry::Evict { sequence } => {
                let before = self.records.len();
                self.records.retain(|r| r.sequence != sequence);
                self.failures.remove(&sequence);
                if self.records.len() < before {
                    self.dropped += 1;
                }
            }
        }
        Ok(())
    }

    /// Rebuild a snapshot from a sequence of entries.
    ///
    /// Returns `None` if there was no snapshot entry to start from and no
    /// records were appended.
    pub fn replay(entries: impl IntoIterator<Item = JournalEntry>) -> Result<Option<Self>> {
        let mut current: Option<BufferSnapshot> = None;
        for entry in entries {
            match (&mut current, entry) {
                (slot, JournalEntry::Snapshot(snapshot)) => {
                    let mut base = BufferSnapshot::new(snapshot.device_id.clone());
                    base.apply(JournalEntry::Snapshot(snapshot))?;
                    *slot = Some(base);
                }
                (Some(snapshot), entry) => snapshot.apply(entry)?,
                (None, entry) => {
                    tracing::warn!(?entry, "journal entry before any snapshot, skipping");
                }
            }
        }
        Ok(current)
    }

    /// Number of records in the snapshot.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Failed send attempts of a record.
    pub fn failures_of(&self, sequence: Sequence) -> u32 {
        self.failures.get(&sequence).copied().unwrap_or(0)
    }
}

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JournalEntry {
    /// Full buffer state
    Snapshot(BufferSnapshot),
    /// A record was accepted
    Append { record: Record },
    /// A send of these records failed
    Requeue { sequences: Vec<Sequence> },
    /// Records were acknowledged or dead-lettered
    Remove { sequences: Vec<Sequence> },
    /// A record was evicted because the buffer was full
    Evict { sequence: Sequence },
}

/// Storage backend for the buffer's journal.
pub trait Journal: Send + std::fmt::Debug {
    /// Read back the current state, if any was stored.
    fn load(&mut self) -> Result<Option<BufferSnapshot>>;

    /// Durably record one change.
    fn append(&mut self, entry: &JournalEntry) -> Result<()>;

    /// Replace the whole journal with a single snapshot.
    fn compact(&mut self, snapshot: &BufferSnapshot) -> Result<()>;

    /// Whether entries survive a process restart.
    fn is_durable(&self) -> bool;
}

/// JSON-lines journal in a directory on disk.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Option<File>,
    /// File length after our last complete write; `None` until checked
    written_len: Option<u64>,
    sync_writes: bool,
}

impl FileJournal {
    /// Open (or create) the journal in `dir`.
    pub fn open(dir: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(JOURNAL_FILE_NAME),
            file: None,
            written_len: None,
            sync_writes,
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::Storage("journal file not open".into()))
    }

    /// Whether the file ends in the middle of a line.
    fn has_open_line(&self, len: u64) -> Result<bool> {
        if len == 0 {
            return Ok(false);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(len - 1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }

    fn encode(entry: &JournalEntry) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(entry).map_err(|e| Error::Storage(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }
}

impl Journal for FileJournal {
    fn load(&mut self) -> Result<Option<BufferSnapshot>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // Torn writes never end a line, so the entries around
                    // one are intact.
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %e,
                        "skipping unreadable journal line"
                    );
                }
            }
        }

        BufferSnapshot::replay(entries)
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let mut line = Self::encode(entry)?;
        let len = self.writer()?.metadata()?.len();

        // Someone else wrote, or a write of ours broke off: terminate the
        // partial line so this entry starts on its own.
        if self.written_len != Some(len) && self.has_open_line(len)? {
            tracing::warn!(path = %self.path.display(), "journal ends in a partial line, closing it");
            line.insert(0, b'\n');
        }

        let sync = self.sync_writes;
        let file = self.writer()?;
        let written = file.write_all(&line).and_then(|()| {
            if sync {
                file.sync_data()
            } else {
                Ok(())
            }
        });

        match written {
            Ok(()) => {
                self.written_len = Some(len + line.len() as u64);
                Ok(())
            }
            Err(e) => {
                // Cut off whatever part of the entry made it to the file
                if let Err(truncate) = file.set_len(len) {
                    tracing::warn!(error = %truncate, "failed to truncate partial journal entry");
                }
                self.written_len = None;
                Err(e.into())
            }
        }
    }

    fn compact(&mut self, snapshot: &BufferSnapshot) -> Result<()> {
        let tmp = self.path.with_extension("journal.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&Self::encode(&JournalEntry::Snapshot(snapshot.clone()))?)?;
            file.sync_all()?;
        }
        // Drop the append handle before the rename so the next write reopens
        // the new file.
        self.file = None;
        self.written_len = None;
        fs::rename(&tmp, &self.path)?;

        tracing::debug!(
            path = %self.path.display(),
            records = snapshot.record_count(),
            "journal compacted"
        );
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// In-memory journal.
///
/// Clones share the same entries, so a clone handed to a second buffer
/// behaves like reopening the same journal after a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemoryJournal {
    /// Create an empty in-memory journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Journal for MemoryJournal {
    fn load(&mut self) -> Result<Option<BufferSnapshot>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        BufferSnapshot::replay(entries)
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn compact(&mut self, snapshot: &BufferSnapshot) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        entries.push(JournalEntry::Snapshot(snapshot.clone()));
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
