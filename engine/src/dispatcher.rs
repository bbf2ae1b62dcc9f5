//! Dispatcher - drains the buffer and delivers batches.
//!
//! Each send attempt goes `Idle → Sending → Acked | Failed`:
//!
//! - **Acked**: the endpoint confirmed the batch up to some sequence; those
//!   records leave the buffer. Any record above that sequence is requeued
//!   and the attempt counts as failed.
//! - **Failed**: network error, timeout, non-2xx status or unreadable
//!   response. The batch is requeued, the next attempt waits out an
//!   exponential backoff, and records that failed more than `max_retries`
//!   times move to the dead-letter store.
//!
//! Immediate-priority records, explicit flushes and full batches wake the
//! loop early; immediate records and flushes also cut a running backoff
//! short. Shutdown cancels a send in progress and returns its batch to the
//! queue untouched.

use crate::backoff::Backoff;
use crate::transport::{Transport, TransportError, UploadRequest, UploadResponse};
use crate::{
    now_millis, Batch, DeadLetterStore, EngineConfig, Error, EventBuffer, IdentityStore, Sequence,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capacity of the diagnostic channel.
const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 64;

/// Where the dispatcher is in a send attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    #[default]
    Idle,
    Sending,
    Acked,
    Failed,
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub state: DispatchState,
    /// Send attempts started
    pub batches_sent: u64,
    /// Attempts that were acknowledged in full
    pub batches_acked: u64,
    /// Records confirmed by the endpoint
    pub records_acked: u64,
    /// Failed attempts, each followed by a retry
    pub retries: u64,
    /// Failed attempts since the last acknowledged one
    pub consecutive_failures: u32,
    /// Records moved to the dead-letter store
    pub dead_lettered: u64,
    /// Highest sequence the endpoint acknowledged
    pub acked_through: Sequence,
    /// Last failure, if any
    pub last_error: Option<String>,
}

/// State shared between the dispatcher task and the engine facade.
#[derive(Debug)]
pub struct DispatchShared {
    wake: Notify,
    flush_requested: AtomicBool,
    stats: Mutex<DispatchStats>,
    diagnostics: broadcast::Sender<Error>,
}

impl DispatchShared {
    fn new() -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CHANNEL_CAPACITY);
        Self {
            wake: Notify::new(),
            flush_requested: AtomicBool::new(false),
            stats: Mutex::new(DispatchStats::default()),
            diagnostics,
        }
    }

    /// Tell the dispatcher something was enqueued.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Ask for an out-of-cycle send of everything queued.
    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to background errors (buffer full, failed sends, dead letters).
    pub fn subscribe(&self) -> broadcast::Receiver<Error> {
        self.diagnostics.subscribe()
    }

    /// Publish a background error. Nobody listening is fine.
    pub fn report(&self, error: Error) {
        self.diagnostics.send(error).ok();
    }

    fn update(&self, f: impl FnOnce(&mut DispatchStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Numeric policy of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_batch_records: usize,
    pub max_batch_bytes: usize,
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl From<&EngineConfig> for DispatchPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_batch_records: config.max_batch_records,
            max_batch_bytes: config.max_batch_bytes,
            flush_interval: config.flush_interval(),
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
        }
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The whole batch was acknowledged
    Acked { records: usize },
    /// The batch (or part of it) went back to the queue
    Failed,
    /// Shutdown interrupted the send
    Cancelled,
}

/// Result of draining the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing left to send
    Drained { batches: usize, records: usize },
    /// A send failed; the rest waits for the backoff
    Failed,
    /// Shutdown interrupted the drain
    Cancelled,
}

/// Sends batches from the buffer to the collection endpoint.
pub struct Dispatcher {
    buffer: Arc<EventBuffer>,
    identity: Arc<IdentityStore>,
    transport: Arc<dyn Transport>,
    dead_letters: Arc<DeadLetterStore>,
    policy: DispatchPolicy,
    shared: Arc<DispatchShared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        buffer: Arc<EventBuffer>,
        identity: Arc<IdentityStore>,
        transport: Arc<dyn Transport>,
        dead_letters: Arc<DeadLetterStore>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            buffer,
            identity,
            transport,
            dead_letters,
            policy,
            shared: Arc::new(DispatchShared::new()),
        }
    }

    /// Handle used by the facade to signal and observe the dispatcher.
    pub fn shared(&self) -> Arc<DispatchShared> {
        Arc::clone(&self.shared)
    }

    /// Send one batch and settle its records.
    pub async fn send_batch(&self, batch: Batch, shutdown: &CancellationToken) -> Attempt {
        // The collector checks the identity against the records' app ID, so
        // it only goes along while the app ID is unchanged
        let identity = self
            .identity
            .snapshot()
            .ok()
            .filter(|i| batch.app_id().map_or(true, |app_id| app_id == i.app_id));
        let request = UploadRequest::new(self.buffer.device_id(), identity, &batch, now_millis());

        self.shared.update(|s| {
            s.state = DispatchState::Sending;
            s.batches_sent += 1;
        });
        tracing::debug!(
            records = batch.len(),
            attempt = batch.attempt,
            first = ?batch.first_sequence(),
            last = ?batch.last_sequence(),
            "sending batch"
        );

        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = tokio::time::timeout(self.policy.request_timeout, self.transport.send(&request)) => Some(result),
        };

        let result = match sent {
            None => {
                let returned = self.buffer.release(&batch);
                self.shared.update(|s| s.state = DispatchState::Idle);
                tracing::info!(records = returned, "send cancelled, batch returned to queue");
                return Attempt::Cancelled;
            }
            Some(Err(_elapsed)) => Err(TransportError::Timeout(self.policy.request_timeout)),
            Some(Ok(result)) => result,
        };

        match result {
            Ok(response) => self.settle(&batch, response),
            Err(e) => self.fail(&batch, e.into()),
        }
    }

    fn settle(&self, batch: &Batch, response: UploadResponse) -> Attempt {
        let acked = match self.buffer.acknowledge(response.acked_through) {
            Ok(acked) => acked,
            Err(e) => return self.fail(batch, e),
        };

        let pending = batch
            .records
            .iter()
            .filter(|r| r.sequence > response.acked_through)
            .count();
        if pending > 0 {
            return self.fail(
                batch,
                Error::TransmissionFailed(format!(
                    "endpoint acknowledged through {}, {} record(s) unconfirmed",
                    response.acked_through, pending
                )),
            );
        }

        self.shared.update(|s| {
            s.state = DispatchState::Acked;
            s.batches_acked += 1;
            s.records_acked += acked as u64;
            s.consecutive_failures = 0;
            s.acked_through = s.acked_through.max(response.acked_through);
        });
        tracing::debug!(
            records = acked,
            acked_through = response.acked_through,
            "batch acknowledged"
        );

        Attempt::Acked { records: acked }
    }

    fn fail(&self, batch: &Batch, error: Error) -> Attempt {
        let requeued = self.buffer.requeue(batch);
        self.shared.update(|s| {
            s.state = DispatchState::Failed;
            s.retries += 1;
            s.consecutive_failures += 1;
            s.last_error = Some(error.to_string());
        });
        tracing::warn!(
            attempt = batch.attempt,
            requeued,
            error = %error,
            "batch send failed"
        );
        self.shared.report(error);

        let dead = self.dead_letter_exhausted();
        if dead > 0 && !batch.records.iter().any(|r| self.buffer.contains(r.sequence)) {
            // Nothing of the failed batch is left to back off for
            self.shared.update(|s| s.consecutive_failures = 0);
        }
        Attempt::Failed
    }

    /// Move exhausted records to the dead-letter store; returns how many.
    fn dead_letter_exhausted(&self) -> usize {
        let store = &self.dead_letters;
        let dead = match self
            .buffer
            .dead_letter_exhausted(self.policy.max_retries, |letters| store.persist(letters))
        {
            Ok(dead) => dead,
            Err(e) => {
                tracing::error!(error = %e, "failed to dead-letter exhausted records, keeping them queued");
                return 0;
            }
        };

        let (Some(first), Some(last)) = (
            dead.iter().map(|d| d.record.sequence).min(),
            dead.iter().map(|d| d.record.sequence).max(),
        ) else {
            return 0;
        };

        let count = dead.len();
        self.shared.update(|s| s.dead_lettered += count as u64);
        tracing::error!(
            count,
            first,
            last,
            max_retries = self.policy.max_retries,
            "records exceeded retry limit and were dead-lettered"
        );
        self.shared.report(Error::DeadLettered { count, first, last });
        count
    }

    /// Send batches until the buffer is empty or a send fails.
    pub async fn drain(&self, shutdown: &CancellationToken) -> DrainOutcome {
        let mut batches = 0;
        let mut records = 0;

        loop {
            if shutdown.is_cancelled() {
                return DrainOutcome::Cancelled;
            }
            let Some(batch) = self
                .buffer
                .peek_batch(self.policy.max_batch_records, self.policy.max_batch_bytes)
            else {
                self.shared.update(|s| s.state = DispatchState::Idle);
                return DrainOutcome::Drained { batches, records };
            };

            match self.send_batch(batch, shutdown).await {
                Attempt::Acked { records: acked } => {
                    batches += 1;
                    records += acked;
                }
                Attempt::Failed => return DrainOutcome::Failed,
                Attempt::Cancelled => return DrainOutcome::Cancelled,
            }
        }
    }

    fn should_send_early(&self, backing_off: bool) -> bool {
        let flush = self.shared.flush_requested.swap(false, Ordering::SeqCst);
        let stats = self.buffer.stats();
        if stats.queued == 0 {
            return false;
        }
        if stats.immediate_queued > 0 && backing_off {
            tracing::debug!("immediate record cuts backoff short");
        }
        flush
            || stats.immediate_queued > 0
            || (!backing_off && stats.queued >= self.policy.max_batch_records)
    }

    /// Run the dispatch loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(device_id = %self.buffer.device_id(), "dispatcher started");

        let mut backing_off = false;
        let mut next_attempt = if self.buffer.is_empty() {
            Instant::now() + self.policy.flush_interval
        } else {
            Instant::now()
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.shared.wake.notified() => {
                    if !self.should_send_early(backing_off) {
                        continue;
                    }
                }
                _ = tokio::time::sleep_until(next_attempt) => {}
            }

            match self.drain(&shutdown).await {
                DrainOutcome::Drained { batches, records } => {
                    if batches > 0 {
                        tracing::debug!(batches, records, "buffer drained");
                    }
                    backing_off = false;
                    next_attempt = Instant::now() + self.policy.flush_interval;
                }
                DrainOutcome::Failed => {
                    let failures = self.shared.stats().consecutive_failures;
                    if failures == 0 {
                        // The failing records were dead-lettered
                        backing_off = false;
                        next_attempt = Instant::now();
                        continue;
                    }
                    let delay = self.policy.backoff.delay(failures);
                    tracing::info!(failures, delay_ms = delay.as_millis() as u64, "backing off");
                    backing_off = true;
                    next_attempt = Instant::now() + delay;
                }
                DrainOutcome::Cancelled => break,
            }
        }

        tracing::info!("dispatcher stopped");
    }

    /// Spawn the dispatch loop on the current tokio runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
