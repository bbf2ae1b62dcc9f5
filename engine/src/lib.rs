//! # Approver Engine
//!
//! At-least-once delivery of telemetry and push-token updates from a
//! device to the Approver collection endpoint.
//!
//! The engine sits behind the SDK surface. Every call becomes a record
//! stamped with the current identity and a strictly increasing sequence
//! number, lands in a durable buffer, and is delivered in batches by a
//! background dispatcher that retries with backoff until the endpoint
//! acknowledges it.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is one unit of telemetry or identity-state change:
//! - [`RecordBody::Event`] - a named analytics event
//! - [`RecordBody::UserAttributes`] - user info (uploaded immediately)
//! - [`RecordBody::PushTokenUpdate`] - a new or cleared push token
//! - [`RecordBody::PushReceipt`] - a received push (uploaded immediately)
//!
//! ### Buffer
//!
//! The [`EventBuffer`] is a bounded queue backed by a [`journal`]. Records
//! leave it only when the endpoint acknowledges them, when the buffer is
//! full and they are the oldest, or when they exhaust their retries and
//! move to the [`DeadLetterStore`].
//!
//! ### Dispatcher
//!
//! The [`Dispatcher`] drains the buffer in batches. Each attempt is
//! acknowledged or failed; failures are requeued and retried with
//! exponential backoff. Immediate records skip the wait.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use approver_engine::{Attributes, Engine, EngineConfig};
//!
//! # async fn run() -> approver_engine::error::Result<()> {
//! let engine = Engine::with_http(EngineConfig {
//!     storage_dir: Some("/var/lib/approver".into()),
//!     ..EngineConfig::default()
//! })?;
//!
//! engine.initialize("app-1")?;
//! engine.log_event(
//!     "purchase",
//!     Attributes::from([("sku".to_string(), "x".to_string())]),
//! )?;
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## FFI
//!
//! The [`ffi`] module provides C-compatible functions for use from other languages
//! (Swift, Kotlin, Dart). All data is exchanged as JSON strings.

pub mod backoff;
pub mod buffer;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod identity;
pub mod journal;
pub mod payload;
pub mod permission;
pub mod record;
pub mod sequence;
pub mod transport;

// Re-export main types at crate root
pub use backoff::Backoff;
pub use buffer::{AppendOutcome, Batch, BufferStats, DeadLetter, EventBuffer};
pub use config::{ConfigError, EngineConfig, DEFAULT_ENDPOINT};
pub use dead_letter::DeadLetterStore;
pub use dispatcher::{
    Attempt, DispatchPolicy, DispatchShared, DispatchState, DispatchStats, Dispatcher,
    DrainOutcome,
};
pub use engine::Engine;
pub use error::Error;
pub use identity::{IdentitySnapshot, IdentityStore};
pub use journal::{BufferSnapshot, FileJournal, Journal, JournalEntry, MemoryJournal};
pub use payload::{
    apply_best_attempt_content, extract_push_payload, Alert, NotificationContent,
    NotificationRequest, PushPayload,
};
pub use permission::{
    AuthorizationOptions, AuthorizationResponder, PermissionRequest, PushAuthorizer,
};
pub use record::{Priority, PushService, PushToken, Record, RecordBody};
pub use sequence::SequenceClock;
pub use transport::{HttpTransport, Transport, TransportError, UploadRequest, UploadResponse};

/// Type aliases for clarity
pub type Sequence = u64;
pub type Timestamp = u64;
pub type DeviceId = String;
pub type Attributes = std::collections::BTreeMap<String, String>;

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
