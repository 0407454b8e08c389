//! Error types for hop discovery runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for hop discovery.
#[derive(Error, Debug)]
pub enum TraceError {
    // Run failures
    #[error("Failed to start transport for {host}: {source}")]
    TransportStart {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send probe (seq={}): {source}", display_seq(.sequence))]
    ProbeSend {
        sequence: Option<u16>,
        #[source]
        source: std::io::Error,
    },

    #[error("Maximum TTL {max_ttl} reached without a reply from the destination")]
    TtlExceeded { max_ttl: u8 },

    #[error("A trace is already running")]
    AlreadyRunning,

    // Configuration errors
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    // Internal errors
    #[error("Engine task is no longer running")]
    EngineClosed,
}

/// Coarse classification handed to observers alongside the error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportStartFailure,
    ProbeSendFailure,
    TtlExceeded,
    AlreadyRunning,
    InvalidSettings,
    EngineClosed,
}

impl TraceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportStart { .. } => ErrorKind::TransportStartFailure,
            Self::ProbeSend { .. } => ErrorKind::ProbeSendFailure,
            Self::TtlExceeded { .. } => ErrorKind::TtlExceeded,
            Self::AlreadyRunning => ErrorKind::AlreadyRunning,
            Self::InvalidSettings(_) => ErrorKind::InvalidSettings,
            Self::EngineClosed => ErrorKind::EngineClosed,
        }
    }

    /// Returns false for outcomes that end a run the way the protocol expects
    /// (the TTL budget running out) rather than through a failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TtlExceeded { .. })
    }
}

fn display_seq(sequence: &Option<u16>) -> String {
    sequence.map_or_else(|| "-".to_string(), |seq| seq.to_string())
}

/// Result type alias for hop discovery operations.
pub type TraceResult<T> = Result<T, TraceError>;
