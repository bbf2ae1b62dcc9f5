//! Edge case tests for approver-engine
//!
//! These tests cover buffer boundaries, journal recovery and unusual inputs.

use approver_engine::{
    Attributes, EventBuffer, FileJournal, IdentitySnapshot, Journal, MemoryJournal, Priority,
    PushPayload, PushToken, RecordBody,
};
use proptest::prelude::*;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;

fn identity() -> IdentitySnapshot {
    IdentitySnapshot {
        app_id: "app-1".into(),
        device_id: "device-1".into(),
        push_token: None,
        user_id: None,
        user_email: None,
    }
}

fn event(name: &str) -> RecordBody {
    RecordBody::Event {
        name: name.into(),
        attributes: Attributes::new(),
    }
}

fn user_info() -> RecordBody {
    RecordBody::UserAttributes {
        attributes: Attributes::from([("plan".to_string(), "pro".to_string())]),
    }
}

fn memory_buffer(capacity: usize) -> EventBuffer {
    EventBuffer::open(Box::new(MemoryJournal::new()), "device-1", capacity, 100).unwrap()
}

// ============================================================================
// Capacity
// ============================================================================

#[test]
fn capacity_plus_one_evicts_oldest() {
    let buffer = memory_buffer(3);
    for name in ["a", "b", "c"] {
        let outcome = buffer.append(event(name), identity()).unwrap();
        assert_eq!(outcome.evicted, None);
    }

    let outcome = buffer.append(event("d"), identity()).unwrap();
    assert_eq!(outcome.evicted, Some(1));
    assert_eq!(outcome.dropped, 1);
    assert_eq!(buffer.len(), 3);
    assert_eq!(buffer.dropped(), 1);

    let sequences: Vec<_> = buffer.pending_records().iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
}

#[test]
fn eviction_can_take_in_flight_record() {
    let buffer = memory_buffer(2);
    buffer.append(event("a"), identity()).unwrap();
    let batch = buffer.peek_batch(1, usize::MAX).unwrap();
    buffer.append(event("b"), identity()).unwrap();

    let outcome = buffer.append(event("c"), identity()).unwrap();
    assert_eq!(outcome.evicted, Some(1));

    // The evicted record can no longer be acknowledged or requeued
    assert_eq!(buffer.requeue(&batch), 0);
    assert_eq!(buffer.acknowledge(1).unwrap(), 0);
    assert_eq!(buffer.len(), 2);
}

#[test]
fn capacity_of_one() {
    let buffer = memory_buffer(1);
    for name in ["a", "b", "c", "d"] {
        buffer.append(event(name), identity()).unwrap();
    }
    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer.dropped(), 3);
    assert_eq!(buffer.pending_records()[0].sequence, 4);
}

// ============================================================================
// Acknowledgment
// ============================================================================

#[test]
fn replaying_acknowledged_batch_is_noop() {
    let buffer = memory_buffer(10);
    buffer.append(event("a"), identity()).unwrap();
    buffer.append(event("b"), identity()).unwrap();

    let batch = buffer.peek_batch(10, usize::MAX).unwrap();
    assert_eq!(buffer.acknowledge(2).unwrap(), 2);

    assert_eq!(buffer.requeue(&batch), 0);
    assert_eq!(buffer.acknowledge(2).unwrap(), 0);
    assert!(buffer.is_empty());
    assert_eq!(buffer.stats().queued, 0);
}

#[test]
fn acknowledge_ignores_queued_records() {
    let buffer = memory_buffer(10);
    for _ in 0..3 {
        buffer.append(event("normal"), identity()).unwrap();
    }
    buffer.append(user_info(), identity()).unwrap();

    // Only the immediate record (sequence 4) goes out
    let batch = buffer.peek_batch(1, usize::MAX).unwrap();
    assert_eq!(batch.sequences(), vec![4]);

    // Acknowledging through 4 must not touch 1..=3, which were never sent
    assert_eq!(buffer.acknowledge(4).unwrap(), 1);
    assert_eq!(buffer.stats().queued, 3);
}

#[test]
fn requeue_goes_before_newer_records() {
    let buffer = memory_buffer(10);
    buffer.append(event("a"), identity()).unwrap();
    buffer.append(event("b"), identity()).unwrap();
    let batch = buffer.peek_batch(10, usize::MAX).unwrap();

    buffer.append(event("c"), identity()).unwrap();
    assert_eq!(buffer.requeue(&batch), 2);

    let retry = buffer.peek_batch(10, usize::MAX).unwrap();
    assert_eq!(retry.sequences(), vec![1, 2, 3]);
    assert_eq!(retry.attempt, 2);
}

// ============================================================================
// Priority
// ============================================================================

#[test]
fn immediate_after_ten_normal_goes_first() {
    let buffer = memory_buffer(100);
    for i in 0..10 {
        buffer.append(event(&format!("e{i}")), identity()).unwrap();
    }
    let push = RecordBody::PushReceipt {
        payload: PushPayload::parse(&json!({"aps": {"alert": "hi"}})).unwrap(),
    };
    buffer.append(push, identity()).unwrap();

    let batch = buffer.peek_batch(5, usize::MAX).unwrap();
    assert_eq!(batch.records[0].sequence, 11);
    assert_eq!(batch.records[0].priority, Priority::Immediate);
    assert_eq!(batch.sequences(), vec![11, 1, 2, 3, 4]);
}

#[test]
fn byte_limit_still_sends_oversized_record() {
    let buffer = memory_buffer(10);
    let huge = Attributes::from([("blob".to_string(), "x".repeat(10_000))]);
    buffer
        .append(
            RecordBody::Event {
                name: "big".into(),
                attributes: huge,
            },
            identity(),
        )
        .unwrap();
    buffer.append(event("small"), identity()).unwrap();

    let batch = buffer.peek_batch(10, 1_000).unwrap();
    assert_eq!(batch.sequences(), vec![1]);
    let batch = buffer.peek_batch(10, 1_000).unwrap();
    assert_eq!(batch.sequences(), vec![2]);
}

// ============================================================================
// Journal Recovery
// ============================================================================

#[test]
fn restart_restores_records_and_clock() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = FileJournal::open(dir.path(), true).unwrap();
        let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 100).unwrap();
        for name in ["a", "b", "c"] {
            buffer.append(event(name), identity()).unwrap();
        }
        // One in flight and acknowledged, one in flight at "crash" time
        buffer.peek_batch(1, usize::MAX).unwrap();
        buffer.acknowledge(1).unwrap();
        buffer.peek_batch(1, usize::MAX).unwrap();
    }

    let journal = FileJournal::open(dir.path(), true).unwrap();
    let buffer = EventBuffer::open(Box::new(journal), "other-device", 10, 100).unwrap();
    assert_eq!(buffer.device_id(), "device-1");
    let sequences: Vec<_> = buffer.pending_records().iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![2, 3]);
    assert_eq!(buffer.stats().in_flight, 0);

    let outcome = buffer.append(event("d"), identity()).unwrap();
    assert_eq!(outcome.sequence, 4);
}

#[test]
fn clock_survives_even_when_buffer_emptied() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = FileJournal::open(dir.path(), false).unwrap();
        let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 1).unwrap();
        buffer.append(event("a"), identity()).unwrap();
        buffer.peek_batch(10, usize::MAX).unwrap();
        buffer.acknowledge(1).unwrap();
        assert!(buffer.is_empty());
    }

    let journal = FileJournal::open(dir.path(), false).unwrap();
    let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 1).unwrap();
    assert_eq!(buffer.append(event("b"), identity()).unwrap().sequence, 2);
}

#[test]
fn torn_trailing_line_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = {
        let journal = FileJournal::open(dir.path(), true).unwrap();
        let path = journal.path().to_path_buf();
        let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 100).unwrap();
        buffer.append(event("a"), identity()).unwrap();
        buffer.append(event("b"), identity()).unwrap();
        path
    };

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"kind":"append","record":{"sequ"#).unwrap();
    drop(file);

    let journal = FileJournal::open(dir.path(), true).unwrap();
    let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 100).unwrap();
    assert_eq!(buffer.len(), 2);
    assert_eq!(buffer.append(event("c"), identity()).unwrap().sequence, 3);
}

#[test]
fn torn_line_between_appends_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = FileJournal::open(dir.path(), false).unwrap();
        let path = journal.path().to_path_buf();
        let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 100).unwrap();
        buffer.append(event("a"), identity()).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"kind":"append","rec"#).unwrap();
        drop(file);

        buffer.append(event("b"), identity()).unwrap();
        buffer.append(event("c"), identity()).unwrap();
        let batch = buffer.peek_batch(1, usize::MAX).unwrap();
        buffer.requeue(&batch);
    }

    let journal = FileJournal::open(dir.path(), false).unwrap();
    let buffer = EventBuffer::open(Box::new(journal), "device-1", 10, 100).unwrap();
    let sequences: Vec<_> = buffer.pending_records().iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    // The failed send of record 1 was kept too
    assert_eq!(buffer.peek_batch(1, usize::MAX).unwrap().attempt, 2);
}

#[test]
fn memory_journal_clone_acts_like_reopen() {
    let journal = MemoryJournal::new();
    {
        let buffer = EventBuffer::open(Box::new(journal.clone()), "device-1", 10, 100).unwrap();
        buffer.append(user_info(), identity()).unwrap();
    }
    assert!(!journal.is_empty());

    let mut reopened = journal.clone();
    let snapshot = reopened.load().unwrap().unwrap();
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.last_sequence, 1);
}

// ============================================================================
// Unusual Inputs
// ============================================================================

#[test]
fn unicode_names_and_attributes() {
    let buffer = memory_buffer(10);
    let names = ["日本語テスト", "Привет мир", "🎉🚀💯", "Hello\nWorld\tTab"];
    for name in names {
        let attributes = Attributes::from([(name.to_string(), name.to_string())]);
        buffer
            .append(
                RecordBody::Event {
                    name: name.into(),
                    attributes,
                },
                identity(),
            )
            .unwrap();
    }

    let batch = buffer.peek_batch(10, usize::MAX).unwrap();
    let json = serde_json::to_string(&batch.records).unwrap();
    let back: Vec<approver_engine::Record> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, batch.records);
}

#[test]
fn cleared_push_token_round_trips() {
    let buffer = memory_buffer(10);
    buffer
        .append(RecordBody::PushTokenUpdate { token: None }, identity())
        .unwrap();
    let token = PushToken::Apns {
        token: "a1b2".into(),
    };
    buffer
        .append(
            RecordBody::PushTokenUpdate {
                token: Some(token.clone()),
            },
            identity(),
        )
        .unwrap();

    let records = buffer.pending_records();
    let value = serde_json::to_value(&records[1]).unwrap();
    assert_eq!(value["body"]["token"]["service"], "apns");
    assert_eq!(
        records[1].body,
        RecordBody::PushTokenUpdate { token: Some(token) }
    );
    assert_eq!(records[0].body, RecordBody::PushTokenUpdate { token: None });
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn draining_delivers_each_record_once(
        immediate in proptest::collection::vec(any::<bool>(), 1..60),
        batch_size in 1usize..20,
    ) {
        let buffer = memory_buffer(1_000);
        for (i, is_immediate) in immediate.iter().enumerate() {
            let body = if *is_immediate { user_info() } else { event(&format!("e{i}")) };
            buffer.append(body, identity()).unwrap();
        }

        let mut delivered = Vec::new();
        while let Some(batch) = buffer.peek_batch(batch_size, usize::MAX) {
            // Immediate records never come after normal ones within a batch
            let first_normal = batch.records.iter().position(|r| !r.is_immediate());
            if let Some(first_normal) = first_normal {
                prop_assert!(batch.records[first_normal..].iter().all(|r| !r.is_immediate()));
            }
            let last = batch.records.iter().map(|r| r.sequence).max().unwrap();
            buffer.acknowledge(last).unwrap();
            delivered.extend(batch.sequences());
        }

        delivered.sort_unstable();
        let expected: Vec<u64> = (1..=immediate.len() as u64).collect();
        prop_assert_eq!(delivered, expected);
        prop_assert!(buffer.is_empty());
    }

    #[test]
    fn length_never_exceeds_capacity(capacity in 1usize..20, appends in 0usize..60) {
        let buffer = memory_buffer(capacity);
        for i in 0..appends {
            buffer.append(event(&format!("e{i}")), identity()).unwrap();
        }
        prop_assert_eq!(buffer.len(), appends.min(capacity));
        prop_assert_eq!(buffer.dropped(), appends.saturating_sub(capacity) as u64);
        prop_assert_eq!(buffer.stats().next_sequence, appends as u64 + 1);
    }

    #[test]
    fn failed_sends_never_lose_records(failures in proptest::collection::vec(any::<bool>(), 1..30)) {
        let buffer = memory_buffer(100);
        for i in 0..10 {
            buffer.append(event(&format!("e{i}")), identity()).unwrap();
        }

        let mut acked = 0;
        for fail in failures {
            let Some(batch) = buffer.peek_batch(3, usize::MAX) else { break };
            if fail {
                buffer.requeue(&batch);
            } else {
                acked += buffer.acknowledge(batch.last_sequence().unwrap()).unwrap();
            }
        }

        prop_assert_eq!(acked + buffer.len(), 10);
        prop_assert_eq!(buffer.stats().in_flight, 0);
    }
}
