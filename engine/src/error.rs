//! Error types for the Approver engine.

use crate::Sequence;
use thiserror::Error;

/// All possible errors from the Approver engine.
///
/// Some variants are never returned from a call and only travel over the
/// diagnostic channel (see [`crate::Engine::subscribe`]): `BufferFull`,
/// `TransmissionFailed` and `DeadLettered` describe things that happened
/// in the background.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Facade errors
    #[error("engine not initialized: call initialize with an app id first")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed push payload: {0}")]
    MalformedPayload(String),

    // Delivery errors
    #[error("buffer full: evicted record {evicted} ({dropped} dropped in total)")]
    BufferFull { evicted: Sequence, dropped: u64 },

    #[error("transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("dead-lettered {count} record(s), sequences {first}..={last}")]
    DeadLettered {
        count: usize,
        first: Sequence,
        last: Sequence,
    },

    // Environment errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::NotInitialized;
        assert_eq!(
            err.to_string(),
            "engine not initialized: call initialize with an app id first"
        );

        let err = Error::BufferFull {
            evicted: 7,
            dropped: 3,
        };
        assert_eq!(
            err.to_string(),
            "buffer full: evicted record 7 (3 dropped in total)"
        );

        let err = Error::DeadLettered {
            count: 2,
            first: 4,
            last: 9,
        };
        assert_eq!(err.to_string(), "dead-lettered 2 record(s), sequences 4..=9");
    }

    #[test]
    fn io_errors_become_storage_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: Error = io.into();
        assert_eq!(err, Error::Storage("read-only".into()));
    }
}
