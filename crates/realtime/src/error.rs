// Error taxonomy for the realtime layer.
//
// Connectivity failures are surfaced as channel state, not through these
// types; they only cover calls that can fail synchronously.

use thiserror::Error;

use crate::connection::{ConnectionState, StateEvent};

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("transport request timed out")]
    Timeout,
    #[error("transport rejected the request: {0}")]
    Rejected(String),
    #[error("transport channel is closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("no channel registered for key `{0}`")]
    UnknownChannel(String),
    #[error("channel `{key}` is not connected (state: {state})")]
    NotConnected { key: String, state: ConnectionState },
    #[error("invalid connection transition: {event} while {from}")]
    InvalidTransition { from: ConnectionState, event: StateEvent },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Failure returned by the remote persistence service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("remote call timed out")]
    Timeout,
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("rejected by server validation: {0}")]
    Validation(String),
    #[error("record `{0}` not found")]
    NotFound(String),
}

impl RemoteError {
    /// Transient failures are retried a small fixed number of times.
    pub const fn retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::Permission(_) => "PERMISSION_DENIED",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
        }
    }
}

/// Outcome of an optimistic mutation that did not go through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    /// Rejected locally; no optimistic entry was created and no call was made.
    #[error("invalid mutation: {0}")]
    Validation(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// A broadcast payload that could not be turned into a CRDT update.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("malformed delta envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("delta is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to decode CRDT update: {0}")]
    Decode(String),
    #[error("failed to apply CRDT update: {0}")]
    Apply(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_timeout_are_retryable() {
        assert!(RemoteError::Network("reset".into()).retryable());
        assert!(RemoteError::Timeout.retryable());
        assert!(!RemoteError::Permission("rls".into()).retryable());
        assert!(!RemoteError::Validation("title".into()).retryable());
        assert!(!RemoteError::NotFound("p-1".into()).retryable());
    }

    #[test]
    fn not_connected_message_names_state() {
        let err = RealtimeError::NotConnected {
            key: "workspace:w".into(),
            state: ConnectionState::Reconnecting,
        };
        assert_eq!(err.to_string(), "channel `workspace:w` is not connected (state: reconnecting)");
    }
}
