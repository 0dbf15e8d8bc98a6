//! Leafline real-time link.
//!
//! Client core for the storefront's two live streams: the assistant chat and
//! per-delivery tracking. A channel survives transport loss by reconnecting
//! with exponential backoff, offering its last session id so the server can
//! resume the conversation, and holding outbound messages until the session
//! is attached again.
//!
//! ```no_run
//! use std::sync::Arc;
//! use leafline_link::{ChannelKind, ConnectParams, EventKind, LinkConfig, NetworkObserver};
//!
//! # async fn run() -> Result<(), leafline_link::LinkError> {
//! let config = LinkConfig::new("https://shop.example.com");
//! let network = Arc::new(NetworkObserver::default());
//! let chat = config.channel_builder(ChannelKind::Chat, network)?.spawn();
//!
//! chat.on(EventKind::frame("message"), |event| println!("{event:?}"));
//! chat.connect(ConnectParams::new().with_session_param("persona", "budtender"))?;
//! chat.send_message("do you have any sativa pre-rolls?")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod network;
pub mod transport;

pub use channel::{
    ChannelBuilder, ChannelEvent, ChannelHandle, ChannelState, ChannelStatus, ConnectParams,
    EventKind, FileSessionStore, HeartbeatConfig, MemorySessionStore, ReconnectPolicy,
    SessionStore, Subscription,
};
pub use config::LinkConfig;
pub use endpoint::ChannelKind;
pub use error::LinkError;
pub use network::{NetworkKind, NetworkObserver, NetworkQuality, NetworkStatus};
pub use transport::{Connector, Transport, WebSocketConnector, WebSocketTransport};
