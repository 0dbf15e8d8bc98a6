//! Real-time channels.
//!
//! A channel keeps one logical conversation (chat, or tracking for one
//! delivery) alive over a sequence of physical transports. Each channel is
//! driven by a single task; [`ChannelHandle`] is the cloneable front end.

mod actor;
mod dispatcher;
mod events;
mod handle;
mod heartbeat;
mod queue;
mod reconnect;
mod session;
mod state;

pub use dispatcher::{EventDispatcher, Subscription};
pub use events::{ChannelEvent, EventKind};
pub use handle::{ChannelBuilder, ChannelHandle, ConnectParams};
pub use heartbeat::HeartbeatConfig;
pub use queue::QueuedMessage;
pub use reconnect::{ReconnectPolicy, ReconnectScheduler, ScheduleDecision};
pub use session::{
    FileSessionStore, MemorySessionStore, Session, SessionOutcome, SessionStore, CHAT_SESSION_KEY,
};
pub use state::{AtomicChannelState, ChannelState, ChannelStatus};
