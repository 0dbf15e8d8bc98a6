//! Public channel handle and builder.

use std::collections::BTreeMap;
use std::sync::Arc;

use leafline_proto::normalize_outbound;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use url::Url;

use super::actor::{ChannelActor, Command};
use super::dispatcher::{EventDispatcher, Subscription};
use super::events::{ChannelEvent, EventKind};
use super::heartbeat::HeartbeatConfig;
use super::reconnect::ReconnectPolicy;
use super::session::{MemorySessionStore, SessionStore};
use super::state::{ChannelState, ChannelStatus};
use crate::endpoint::ChannelKind;
use crate::error::LinkError;
use crate::network::NetworkObserver;
use crate::transport::Connector;

/// Parameters for [`ChannelHandle::connect`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    /// Session-scoped metadata sent once per new session (e.g. the persona).
    pub session_params: Map<String, Value>,
    /// Extra query parameters for the endpoint.
    pub query: BTreeMap<String, String>,
}

impl ConnectParams {
    /// Empty parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session parameter.
    #[must_use]
    pub fn with_session_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.session_params.insert(key.into(), value.into());
        self
    }

    /// Add an endpoint query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Configures and starts a channel.
pub struct ChannelBuilder<C: Connector> {
    kind: ChannelKind,
    base: Url,
    connector: C,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    network: Option<Arc<NetworkObserver>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl<C: Connector> ChannelBuilder<C> {
    /// Channel of `kind` against the API base address `base`.
    #[must_use]
    pub fn new(kind: ChannelKind, base: Url, connector: C) -> Self {
        Self {
            kind,
            base,
            connector,
            policy: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            network: None,
            store: None,
        }
    }

    /// Set the reconnection policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set heartbeat behavior.
    #[must_use]
    pub fn with_heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = config;
        self
    }

    /// Share a process-wide network observer.
    #[must_use]
    pub fn with_network_observer(mut self, network: Arc<NetworkObserver>) -> Self {
        self.network = Some(network);
        self
    }

    /// Where the session id is kept. Defaults to memory.
    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the channel task. Must be called inside a tokio runtime.
    ///
    /// The channel starts `Idle`; nothing is opened until
    /// [`ChannelHandle::connect`].
    pub fn spawn(self) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(ChannelStatus::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        let network = self.network.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let actor = ChannelActor::new(
            self.kind.clone(),
            self.base,
            Arc::new(self.connector),
            self.policy,
            self.heartbeat,
            network,
            store,
            Arc::clone(&status),
            Arc::clone(&dispatcher),
        );
        tokio::spawn(actor.run(rx));

        ChannelHandle {
            kind: self.kind,
            commands: tx,
            status,
            dispatcher,
        }
    }
}

/// Cheap, cloneable handle to a running channel.
///
/// Every method returns immediately; the work happens on the channel task in
/// the order the calls were made.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    kind: ChannelKind,
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<ChannelStatus>,
    dispatcher: Arc<EventDispatcher>,
}

impl ChannelHandle {
    /// Open the channel. Ignored unless the channel is `Idle` or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] if the channel task has stopped.
    pub fn connect(&self, params: ConnectParams) -> Result<(), LinkError> {
        self.command(Command::Connect(params))
    }

    /// Send `payload` once the session is attached, queueing it until then.
    ///
    /// A bare string becomes a `message` frame; objects must carry a `type`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unsendable payloads, or
    /// [`LinkError::ChannelClosed`] if the channel task has stopped.
    pub fn send_message(&self, payload: impl Into<Value>) -> Result<(), LinkError> {
        let frame = normalize_outbound(payload.into())?;
        self.command(Command::Send(frame))
    }

    /// Close the channel, dropping queued messages and the session id.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] if the channel task has stopped.
    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.command(Command::Disconnect)
    }

    /// Reset the retry budget and connect now, cycling any open transport.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] if the channel task has stopped.
    pub fn reconnect(&self) -> Result<(), LinkError> {
        self.command(Command::Reconnect)
    }

    /// Disconnect, then reconnect without a session hint so the server
    /// assigns a fresh session.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] if the channel task has stopped.
    pub fn reset_session(&self) -> Result<(), LinkError> {
        self.command(Command::ResetSession)
    }

    /// Stop the channel task. The persisted session id is kept.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] if the channel task has already stopped.
    pub fn shutdown(&self) -> Result<(), LinkError> {
        self.command(Command::Shutdown)
    }

    /// Subscribe to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, callback)
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on_any(callback)
    }

    /// Remove a subscription.
    pub fn off(&self, subscription: Subscription) -> bool {
        self.dispatcher.off(subscription)
    }

    /// Which stream this channel carries.
    #[must_use]
    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.status.state()
    }

    /// Full status view.
    #[must_use]
    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    /// Whether the channel task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Resolves once the channel task has stopped and closed its transport.
    pub async fn stopped(&self) {
        self.commands.closed().await;
    }

    fn command(&self, command: Command) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::ChannelClosed)
    }
}
