//! Event buffer - the durable queue of records waiting for delivery.
//!
//! Records move through two places:
//!
//! - **queued**: accepted, waiting to be picked for a batch
//! - **in flight**: part of a batch handed to the dispatcher
//!
//! Both are durable. A record leaves the buffer only when it is
//! acknowledged, evicted because the buffer is full, or dead-lettered after
//! too many failed sends. All state sits behind a single lock.

use crate::journal::{BufferSnapshot, Journal, JournalEntry};
use crate::{
    error::Result, now_millis, DeviceId, IdentitySnapshot, Priority, Record, RecordBody, Sequence,
    SequenceClock, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A record plus its delivery bookkeeping.
#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    /// Failed send attempts so far
    failures: u32,
}

/// A bounded group of records for one transmission attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// Records in send order: immediate first, then normal
    pub records: Vec<Record>,
    /// Attempt number of this send (1 for records never sent before)
    pub attempt: u32,
}

impl Batch {
    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the batch has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequences in send order.
    pub fn sequences(&self) -> Vec<Sequence> {
        self.records.iter().map(|r| r.sequence).collect()
    }

    /// Lowest sequence in the batch.
    pub fn first_sequence(&self) -> Option<Sequence> {
        self.records.iter().map(|r| r.sequence).min()
    }

    /// Highest sequence in the batch.
    pub fn last_sequence(&self) -> Option<Sequence> {
        self.records.iter().map(|r| r.sequence).max()
    }

    /// App ID all records of the batch were logged under.
    pub fn app_id(&self) -> Option<&str> {
        self.records.first().map(|r| r.identity.app_id.as_str())
    }
}

/// Result of appending a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Sequence assigned to the new record
    pub sequence: Sequence,
    /// Sequence of the record evicted to make room, if any
    pub evicted: Option<Sequence>,
    /// Total records dropped so far
    pub dropped: u64,
}

/// A record removed after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub record: Record,
    /// Failed attempts before it was given up on
    pub failures: u32,
    /// When it was dead-lettered (milliseconds since epoch)
    pub dead_lettered_at: Timestamp,
}

/// Point-in-time counters of the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    /// Records waiting to be sent
    pub queued: usize,
    /// Immediate-priority records among the queued ones
    pub immediate_queued: usize,
    /// Records in a batch awaiting the outcome of a send
    pub in_flight: usize,
    /// Records dropped because the buffer was full
    pub dropped: u64,
    /// Sequence the next record will get
    pub next_sequence: Sequence,
    /// Whether the buffer survives a restart
    pub durable: bool,
}

#[derive(Debug)]
struct BufferState {
    device_id: DeviceId,
    clock: SequenceClock,
    /// Sorted by sequence
    queued: VecDeque<Entry>,
    in_flight: Vec<Entry>,
    dropped: u64,
    removed_since_compaction: usize,
    journal: Box<dyn Journal>,
}

impl BufferState {
    fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    fn snapshot(&self) -> BufferSnapshot {
        let mut records: Vec<Record> = self
            .queued
            .iter()
            .chain(self.in_flight.iter())
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| r.sequence);
        let failures = self
            .queued
            .iter()
            .chain(self.in_flight.iter())
            .filter(|e| e.failures > 0)
            .map(|e| (e.record.sequence, e.failures))
            .collect();

        BufferSnapshot {
            last_sequence: self.clock.last(),
            dropped: self.dropped,
            records,
            failures,
            ..BufferSnapshot::new(self.device_id.clone())
        }
    }

    /// Insert keeping `queued` sorted by sequence.
    fn insert_queued(&mut self, entry: Entry) {
        let at = self
            .queued
            .partition_point(|e| e.record.sequence < entry.record.sequence);
        self.queued.insert(at, entry);
    }

    /// Remove the lowest-sequence unacknowledged record.
    fn evict_oldest(&mut self) -> Option<Sequence> {
        let oldest_in_flight = self
            .in_flight
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.record.sequence)
            .map(|(i, e)| (i, e.record.sequence));
        let oldest_queued = self.queued.front().map(|e| e.record.sequence);

        let evicted = match (oldest_queued, oldest_in_flight) {
            (Some(q), Some((i, f))) if f < q => self.in_flight.remove(i),
            (Some(_), _) => self.queued.pop_front()?,
            (None, Some((i, _))) => self.in_flight.remove(i),
            (None, None) => return None,
        };
        Some(evicted.record.sequence)
    }

    fn note_removed(&mut self, count: usize, compact_after: usize) {
        self.removed_since_compaction += count;
        if self.removed_since_compaction >= compact_after {
            let snapshot = self.snapshot();
            match self.journal.compact(&snapshot) {
                Ok(()) => self.removed_since_compaction = 0,
                Err(e) => tracing::warn!(error = %e, "journal compaction failed"),
            }
        }
    }
}

/// The durable, bounded queue of pending records.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    compact_after: usize,
    durable: bool,
    state: Mutex<BufferState>,
}

impl EventBuffer {
    /// Open a buffer on top of a journal, restoring whatever it holds.
    ///
    /// The device ID stored in the journal wins over `device_id`; a fresh
    /// journal adopts `device_id`. The journal is compacted once on open.
    pub fn open(
        mut journal: Box<dyn Journal>,
        device_id: impl Into<DeviceId>,
        capacity: usize,
        compact_after: usize,
    ) -> Result<Self> {
        let snapshot = journal
            .load()?
            .unwrap_or_else(|| BufferSnapshot::new(device_id));

        let mut clock = SequenceClock::resume_after(snapshot.last_sequence);
        let mut queued = VecDeque::with_capacity(snapshot.records.len());
        let mut records = snapshot.records.clone();
        records.sort_by_key(|r| r.sequence);
        for record in records {
            clock.observe(record.sequence);
            queued.push_back(Entry {
                failures: snapshot.failures_of(record.sequence),
                record,
            });
        }

        let mut state = BufferState {
            device_id: snapshot.device_id.clone(),
            clock,
            queued,
            in_flight: Vec::new(),
            dropped: snapshot.dropped,
            removed_since_compaction: 0,
            journal,
        };
        let restored = state.snapshot();
        state.journal.compact(&restored)?;

        let durable = state.journal.is_durable();
        if !restored.records.is_empty() {
            tracing::info!(
                device_id = %state.device_id,
                records = restored.records.len(),
                last_sequence = restored.last_sequence,
                "restored pending records from journal"
            );
        }

        Ok(Self {
            capacity: capacity.max(1),
            compact_after: compact_after.max(1),
            durable,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device the buffered records belong to.
    pub fn device_id(&self) -> DeviceId {
        self.lock().device_id.clone()
    }

    /// Maximum number of unacknowledged records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Build a record with the next sequence and append it.
    ///
    /// The record is written to the journal before it is accepted; if that
    /// write fails the record is rejected. When the buffer is at capacity
    /// the oldest unacknowledged record is evicted and counted as dropped.
    pub fn append(&self, body: RecordBody, identity: IdentitySnapshot) -> Result<AppendOutcome> {
        let mut state = self.lock();
        let sequence = state.clock.tick();
        let record = Record::new(sequence, now_millis(), identity, body);

        state.journal.append(&JournalEntry::Append {
            record: record.clone(),
        })?;

        let evicted = if state.len() >= self.capacity {
            let evicted = state.evict_oldest();
            if let Some(evicted) = evicted {
                state.dropped += 1;
                if let Err(e) = state.journal.append(&JournalEntry::Evict { sequence: evicted }) {
                    tracing::warn!(sequence = evicted, error = %e, "failed to journal eviction");
                }
                tracing::warn!(
                    sequence = evicted,
                    dropped = state.dropped,
                    "buffer full, evicted oldest record"
                );
            }
            evicted
        } else {
            None
        };

        state.queued.push_back(Entry {
            record,
            failures: 0,
        });
        if evicted.is_some() {
            let compact_after = self.compact_after;
            state.note_removed(1, compact_after);
        }

        Ok(AppendOutcome {
            sequence,
            evicted,
            dropped: state.dropped,
        })
    }

    /// Pick the next batch and move its records in flight.
    ///
    /// Immediate records are taken first, then normal ones, each in
    /// sequence order, until `max_count` records or `max_bytes` of encoded
    /// records are reached. A single record larger than `max_bytes` is
    /// still returned on its own. Returns `None` if nothing is queued.
    ///
    /// All records of a batch share the app ID of its first record; records
    /// logged under another app ID wait for a later batch.
    pub fn peek_batch(&self, max_count: usize, max_bytes: usize) -> Option<Batch> {
        let mut state = self.lock();
        if state.queued.is_empty() {
            return None;
        }

        let max_count = max_count.max(1);
        let mut selected: Vec<Entry> = Vec::new();
        let mut app_id: Option<String> = None;
        let mut bytes = 0usize;

        'fill: for class in [Priority::Immediate, Priority::Normal] {
            let mut i = 0;
            while i < state.queued.len() {
                if selected.len() >= max_count {
                    break 'fill;
                }
                let record = &state.queued[i].record;
                let other_app = app_id
                    .as_deref()
                    .is_some_and(|app| app != record.identity.app_id);
                if record.priority != class || other_app {
                    i += 1;
                    continue;
                }
                let size = record.encoded_len();
                if !selected.is_empty() && bytes + size > max_bytes {
                    break 'fill;
                }
                if let Some(entry) = state.queued.remove(i) {
                    bytes += size;
                    app_id.get_or_insert_with(|| entry.record.identity.app_id.clone());
                    selected.push(entry);
                }
            }
        }

        let attempt = selected.iter().map(|e| e.failures).max().unwrap_or(0) + 1;
        let records = selected.iter().map(|e| e.record.clone()).collect();
        state.in_flight.extend(selected);

        Some(Batch { records, attempt })
    }

    /// Acknowledge every in-flight record with `sequence <= up_to`.
    ///
    /// Returns how many records were removed. Sequences that are not in
    /// flight (already acknowledged, or never sent) are left alone.
    pub fn acknowledge(&self, up_to: Sequence) -> Result<usize> {
        let mut state = self.lock();
        let sequences: Vec<Sequence> = state
            .in_flight
            .iter()
            .filter(|e| e.record.sequence <= up_to)
            .map(|e| e.record.sequence)
            .collect();
        if sequences.is_empty() {
            return Ok(0);
        }

        state.journal.append(&JournalEntry::Remove {
            sequences: sequences.clone(),
        })?;
        state.in_flight.retain(|e| e.record.sequence > up_to);

        let compact_after = self.compact_after;
        state.note_removed(sequences.len(), compact_after);
        Ok(sequences.len())
    }

    /// Return a failed batch's records to the queue.
    ///
    /// Records go back at their sequence position, in front of anything
    /// appended later, and their failure count goes up by one. Records of
    /// the batch that are no longer in flight are skipped, so replaying an
    /// acknowledged batch is a no-op. Returns how many records were requeued.
    pub fn requeue(&self, batch: &Batch) -> usize {
        self.return_to_queue(batch, true)
    }

    /// Return a batch's records to the queue without counting a failure.
    ///
    /// Used when a send is cancelled before it finished.
    pub fn release(&self, batch: &Batch) -> usize {
        self.return_to_queue(batch, false)
    }

    fn return_to_queue(&self, batch: &Batch, failed: bool) -> usize {
        let mut state = self.lock();
        let mut returned = Vec::new();
        for sequence in batch.sequences() {
            let Some(index) = state
                .in_flight
                .iter()
                .position(|e| e.record.sequence == sequence)
            else {
                continue;
            };
            let mut entry = state.in_flight.remove(index);
            if failed {
                entry.failures += 1;
            }
            state.insert_queued(entry);
            returned.push(sequence);
        }

        let count = returned.len();
        if failed && count > 0 {
            // The in-memory count stays right either way; only a restart
            // would forget this failure
            if let Err(e) = state.journal.append(&JournalEntry::Requeue { sequences: returned }) {
                tracing::warn!(records = count, error = %e, "failed to journal failed send");
            }
        }
        count
    }

    /// Remove queued records that failed more than `max_retries` times.
    ///
    /// `persist` receives the dead letters before they leave the journal;
    /// if it fails, nothing is removed and the error is returned. Once
    /// persisted, the records leave the buffer even if the journal cannot
    /// record it; the journal is then rewritten from memory.
    pub fn dead_letter_exhausted<F>(&self, max_retries: u32, persist: F) -> Result<Vec<DeadLetter>>
    where
        F: FnOnce(&[DeadLetter]) -> Result<()>,
    {
        let mut state = self.lock();
        let now = now_millis();
        let dead: Vec<DeadLetter> = state
            .queued
            .iter()
            .filter(|e| e.failures > max_retries)
            .map(|e| DeadLetter {
                record: e.record.clone(),
                failures: e.failures,
                dead_lettered_at: now,
            })
            .collect();
        if dead.is_empty() {
            return Ok(dead);
        }

        persist(&dead)?;
        let sequences: Vec<Sequence> = dead.iter().map(|d| d.record.sequence).collect();
        let journaled = state.journal.append(&JournalEntry::Remove { sequences });
        state.queued.retain(|e| e.failures <= max_retries);

        let compact_after = self.compact_after;
        match journaled {
            Ok(()) => state.note_removed(dead.len(), compact_after),
            Err(e) => {
                tracing::warn!(records = dead.len(), error = %e, "failed to journal dead-lettering, compacting");
                let snapshot = state.snapshot();
                match state.journal.compact(&snapshot) {
                    Ok(()) => state.removed_since_compaction = 0,
                    Err(e) => tracing::warn!(error = %e, "journal compaction failed"),
                }
            }
        }
        Ok(dead)
    }

    /// Current counters.
    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            queued: state.queued.len(),
            immediate_queued: state
                .queued
                .iter()
                .filter(|e| e.record.is_immediate())
                .count(),
            in_flight: state.in_flight.len(),
            dropped: state.dropped,
            next_sequence: state.clock.peek_next(),
            durable: self.durable,
        }
    }

    /// Check whether a record is still waiting for delivery.
    pub fn contains(&self, sequence: Sequence) -> bool {
        let state = self.lock();
        state
            .queued
            .iter()
            .chain(state.in_flight.iter())
            .any(|e| e.record.sequence == sequence)
    }

    /// Unacknowledged records (queued and in flight).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing is waiting for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Copy of all unacknowledged records in sequence order.
    pub fn pending_records(&self) -> Vec<Record> {
        self.lock().snapshot().records
    }

    /// Force a compaction of the journal.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.lock();
        let snapshot = state.snapshot();
        state.journal.compact(&snapshot)?;
        state.removed_since_compaction = 0;
        Ok(())
    }
}
