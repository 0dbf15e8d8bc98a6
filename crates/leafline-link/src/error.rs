//! Error types for leafline-link.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in channel operations.
///
/// Transport and heartbeat failures never reach callers as `Err` values; the
/// channel turns them into events and retries. They still have variants here
/// so the reason strings carried by those events share one vocabulary.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Connection refused, abrupt close or protocol violation.
    #[error("transport error: {0}")]
    Transport(String),

    /// Too many liveness probes went unanswered.
    #[error("heartbeat timeout: {missed} probe(s) unanswered")]
    HeartbeatTimeout {
        /// Consecutive unanswered probes.
        missed: u32,
    },

    /// An inbound payload could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A session frame arrived without a usable session id.
    #[error("session establishment failed: {0}")]
    SessionEstablishment(String),

    /// The reconnection budget is spent.
    #[error("gave up after {attempts} reconnection attempt(s)")]
    MaxAttemptsExceeded {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Connectivity did not return in time.
    #[error("no connectivity within {0:?}")]
    ConnectivityTimeout(Duration),

    /// The channel task has stopped.
    #[error("channel closed")]
    ChannelClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Endpoint could not be derived.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Session id could not be read or written.
    #[error("session persistence failed: {0}")]
    Persistence(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] leafline_proto::ProtoError),
}

impl LinkError {
    /// Whether the channel recovers from this error by reconnecting.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::HeartbeatTimeout { .. } | Self::SessionEstablishment(_)
        )
    }
}
