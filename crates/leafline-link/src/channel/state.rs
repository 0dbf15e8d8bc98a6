//! Channel state types.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Lifecycle state of a channel.
///
/// `SessionPending` and `SessionAttached` are the two halves of "open": the
/// transport is up in both, but outbound traffic only flows once the server
/// has (re)attached the logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not connected and not trying to be.
    Idle,
    /// Transport open in progress.
    Connecting,
    /// Transport open, waiting for the session frame.
    SessionPending,
    /// Transport open and session attached; traffic flows.
    SessionAttached,
    /// Transport lost, retry scheduled or waiting for the network.
    Reconnecting,
    /// Explicit disconnect in progress.
    Closing,
    /// Retry budget exhausted; only a manual reconnect leaves this state.
    Failed,
}

impl ChannelState {
    /// Whether a transport is open in this state.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::SessionPending | Self::SessionAttached)
    }

    /// Short lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::SessionPending => "session_pending",
            Self::SessionAttached => "session_attached",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Failed => "failed",
        }
    }

    const fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::SessionPending,
            3 => Self::SessionAttached,
            4 => Self::Reconnecting,
            5 => Self::Closing,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic wrapper for channel state.
#[derive(Debug)]
pub struct AtomicChannelState(AtomicU32);

impl AtomicChannelState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ChannelState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ChannelState {
        ChannelState::from_u32(self.0.load(Ordering::SeqCst))
    }

    /// Store a new state.
    pub fn store(&self, state: ChannelState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }
}

/// Read-only view of a channel, written by the channel task.
#[derive(Debug)]
pub struct ChannelStatus {
    state: AtomicChannelState,
    reconnect_attempt: AtomicU32,
    queued: AtomicUsize,
    session_id: RwLock<Option<String>>,
    last_heartbeat_at: RwLock<Option<DateTime<Utc>>>,
}

impl ChannelStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicChannelState::new(ChannelState::Idle),
            reconnect_attempt: AtomicU32::new(0),
            queued: AtomicUsize::new(0),
            session_id: RwLock::new(None),
            last_heartbeat_at: RwLock::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state.load()
    }

    /// Consecutive failed attempts since the last attached session.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::SeqCst)
    }

    /// Messages waiting for the session to attach.
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Known session id, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// When the last heartbeat answer arrived.
    #[must_use]
    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat_at.read()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state);
    }

    pub(crate) fn set_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::SeqCst);
    }

    pub(crate) fn set_queued(&self, queued: usize) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    pub(crate) fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write() = session_id;
    }

    pub(crate) fn set_last_heartbeat_at(&self, at: Option<DateTime<Utc>>) {
        *self.last_heartbeat_at.write() = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_enum() {
        assert_eq!(ChannelState::Idle as u32, 0);
        assert_eq!(ChannelState::Connecting as u32, 1);
        assert_eq!(ChannelState::SessionPending as u32, 2);
        assert_eq!(ChannelState::SessionAttached as u32, 3);
        assert_eq!(ChannelState::Reconnecting as u32, 4);
        assert_eq!(ChannelState::Closing as u32, 5);
        assert_eq!(ChannelState::Failed as u32, 6);
    }

    #[test]
    fn test_atomic_channel_state_roundtrips_every_state() {
        let state = AtomicChannelState::new(ChannelState::Idle);
        for s in [
            ChannelState::Connecting,
            ChannelState::SessionPending,
            ChannelState::SessionAttached,
            ChannelState::Reconnecting,
            ChannelState::Closing,
            ChannelState::Failed,
            ChannelState::Idle,
        ] {
            state.store(s);
            assert_eq!(state.load(), s);
        }
    }

    #[test]
    fn test_is_open() {
        assert!(ChannelState::SessionPending.is_open());
        assert!(ChannelState::SessionAttached.is_open());
        assert!(!ChannelState::Connecting.is_open());
        assert!(!ChannelState::Reconnecting.is_open());
        assert!(!ChannelState::Idle.is_open());
    }

    #[test]
    fn test_display() {
        assert_eq!(ChannelState::SessionAttached.to_string(), "session_attached");
        assert_eq!(ChannelState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_status_defaults() {
        let status = ChannelStatus::new();
        assert_eq!(status.state(), ChannelState::Idle);
        assert_eq!(status.reconnect_attempt(), 0);
        assert_eq!(status.queued_messages(), 0);
        assert!(status.session_id().is_none());
        assert!(status.last_heartbeat_at().is_none());
    }
}
