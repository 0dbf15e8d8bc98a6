//! Channel event types.

use std::time::Duration;

use leafline_proto::ApplicationFrame;

use super::state::ChannelState;

/// Events emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Session attached; outbound traffic flows.
    Connected {
        /// Attached session.
        session_id: String,
        /// Whether the server reattached the session we offered.
        resumed: bool,
    },
    /// Transport lost or closed on request.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A retry is scheduled.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Retry budget, `None` when unlimited.
        max_attempts: Option<u32>,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Retry budget spent; the channel stays down until `reconnect()`.
    ConnectionFailed {
        /// Attempts made.
        attempts: u32,
        /// Last failure seen.
        last_error: String,
    },
    /// No connectivity; the next attempt waits for the network.
    WaitingForNetwork,
    /// Lifecycle transition.
    StateChanged {
        /// Previous state.
        from: ChannelState,
        /// New state.
        to: ChannelState,
    },
    /// Application frame from the server.
    Message(ApplicationFrame),
}

impl ChannelEvent {
    /// Kind used for subscription matching.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            Self::WaitingForNetwork => EventKind::WaitingForNetwork,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::Message(frame) => EventKind::Frame(frame.frame_type.clone()),
        }
    }
}

/// What a subscriber listens for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`ChannelEvent::Connected`].
    Connected,
    /// [`ChannelEvent::Disconnected`].
    Disconnected,
    /// [`ChannelEvent::Reconnecting`].
    Reconnecting,
    /// [`ChannelEvent::ConnectionFailed`].
    ConnectionFailed,
    /// [`ChannelEvent::WaitingForNetwork`].
    WaitingForNetwork,
    /// [`ChannelEvent::StateChanged`].
    StateChanged,
    /// Every application frame.
    Message,
    /// Application frames with this `type`.
    Frame(String),
}

impl EventKind {
    /// Application frames of type `frame_type`.
    #[must_use]
    pub fn frame(frame_type: impl Into<String>) -> Self {
        Self::Frame(frame_type.into())
    }

    /// Whether a subscriber for `self` receives `event`.
    #[must_use]
    pub fn matches(&self, event: &ChannelEvent) -> bool {
        match (self, event) {
            (Self::Message, ChannelEvent::Message(_)) => true,
            (Self::Frame(wanted), ChannelEvent::Message(frame)) => *wanted == frame.frame_type,
            (kind, event) => *kind == event.kind(),
        }
    }
}
