//! The channel task.
//!
//! One task per channel owns the transport, the queue, the session and every
//! timer. Handle calls arrive as [`Command`]s, so transitions never overlap.
//! Work that has to wait (opening a transport, heartbeat ticks) runs in
//! helper tasks whose results come back tagged with a generation; anything
//! tagged with a superseded generation is discarded.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use leafline_proto::{encode_application, ControlFrame, InboundFrame};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::dispatcher::EventDispatcher;
use super::events::ChannelEvent;
use super::handle::ConnectParams;
use super::heartbeat::{HeartbeatConfig, HeartbeatHandle, HeartbeatSignal};
use super::queue::{OutboundQueue, QueuedMessage};
use super::reconnect::{ReconnectPolicy, ReconnectScheduler, ScheduleDecision};
use super::session::{SessionManager, SessionOutcome, SessionStore};
use super::state::{ChannelState, ChannelStatus};
use crate::endpoint::{channel_endpoint, ChannelKind};
use crate::error::LinkError;
use crate::network::{NetworkObserver, NetworkStatus};
use crate::transport::{Connector, Transport};

/// Requests from [`super::ChannelHandle`].
#[derive(Debug)]
pub(crate) enum Command {
    Connect(ConnectParams),
    /// Already-normalized application frame.
    Send(Value),
    Disconnect,
    Reconnect,
    ResetSession,
    Shutdown,
}

type ConnectResult<T> = (u64, Result<T, LinkError>);

pub(crate) struct ChannelActor<C: Connector> {
    kind: ChannelKind,
    base: Url,
    query: BTreeMap<String, String>,
    connector: Arc<C>,

    state: ChannelState,
    status: Arc<ChannelStatus>,
    dispatcher: Arc<EventDispatcher>,

    network: Arc<NetworkObserver>,
    network_rx: watch::Receiver<NetworkStatus>,
    waiting_for_network: bool,

    scheduler: ReconnectScheduler,
    reconnect_at: Option<Instant>,
    last_error: Option<String>,

    sessions: SessionManager,
    queue: OutboundQueue,

    transport: Option<C::Transport>,
    pending_connect: Option<JoinHandle<()>>,
    connect_generation: u64,
    connect_tx: mpsc::UnboundedSender<ConnectResult<C::Transport>>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult<C::Transport>>,

    heartbeat_config: HeartbeatConfig,
    heartbeat: Option<HeartbeatHandle>,
    heartbeat_generation: u64,
    heartbeat_tx: mpsc::UnboundedSender<HeartbeatSignal>,
    heartbeat_rx: mpsc::UnboundedReceiver<HeartbeatSignal>,
}

impl<C: Connector> ChannelActor<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: ChannelKind,
        base: Url,
        connector: Arc<C>,
        policy: ReconnectPolicy,
        heartbeat_config: HeartbeatConfig,
        network: Arc<NetworkObserver>,
        store: Arc<dyn SessionStore>,
        status: Arc<ChannelStatus>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let sessions = SessionManager::new(kind.session_key(), store);
        status.set_session_id(sessions.hint().map(ToString::to_string));

        Self {
            scheduler: ReconnectScheduler::new(policy).with_network(Arc::clone(&network)),
            network_rx: network.watch(),
            network,
            waiting_for_network: false,
            kind,
            base,
            query: BTreeMap::new(),
            connector,
            state: ChannelState::Idle,
            status,
            dispatcher,
            reconnect_at: None,
            last_error: None,
            sessions,
            queue: OutboundQueue::new(),
            transport: None,
            pending_connect: None,
            connect_generation: 0,
            connect_tx,
            connect_rx,
            heartbeat_config,
            heartbeat: None,
            heartbeat_generation: 0,
            heartbeat_tx,
            heartbeat_rx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!(channel = %self.kind, "channel task started");

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                Some((generation, result)) = self.connect_rx.recv() => {
                    self.on_connect_result(generation, result).await;
                }

                Some(signal) = self.heartbeat_rx.recv() => {
                    self.on_heartbeat(signal).await;
                }

                frame = next_transport_frame(&mut self.transport), if self.transport.is_some() => {
                    self.on_transport_frame(frame).await;
                }

                () = sleep_until(self.reconnect_at), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    debug!(channel = %self.kind, "reconnect timer fired");
                    self.open_transport();
                }

                changed = self.network_rx.changed(), if self.waiting_for_network => {
                    self.on_network_change(changed.is_ok());
                }
            }
        }

        self.shutdown().await;
        debug!(channel = %self.kind, "channel task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(params) => self.connect(params),
            Command::Send(payload) => self.enqueue_or_send(QueuedMessage::new(payload)).await,
            Command::Disconnect => self.disconnect("client disconnect").await,
            Command::Reconnect => self.reconnect().await,
            Command::ResetSession => self.reset_session().await,
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self, params: ConnectParams) {
        if self.state != ChannelState::Idle {
            debug!(channel = %self.kind, state = %self.state, "connect ignored");
            return;
        }

        self.sessions.set_params(params.session_params);
        self.query = params.query;
        self.reset_attempts();
        self.open_transport();
    }

    async fn reconnect(&mut self) {
        info!(channel = %self.kind, state = %self.state, "manual reconnect");
        self.cancel_reconnect();
        self.reset_attempts();
        self.drop_transport("manual reconnect").await;
        self.open_transport();
    }

    async fn disconnect(&mut self, reason: &str) {
        let was_idle = self.state == ChannelState::Idle;

        self.cancel_reconnect();
        self.abort_pending_connect();
        self.stop_heartbeat();
        if !was_idle {
            self.set_state(ChannelState::Closing);
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }

        self.queue.clear();
        self.sync_queue_len();
        self.sessions.clear();
        self.status.set_session_id(None);
        self.reset_attempts();
        self.last_error = None;

        self.set_state(ChannelState::Idle);
        if !was_idle {
            info!(channel = %self.kind, reason = %reason, "disconnected");
            self.emit(ChannelEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    async fn reset_session(&mut self) {
        let was_active = self.state != ChannelState::Idle;
        self.disconnect("session reset").await;
        if was_active {
            self.open_transport();
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_reconnect();
        self.abort_pending_connect();
        self.stop_heartbeat();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.set_state(ChannelState::Idle);
    }

    /// Start a transport open for the current endpoint, superseding any
    /// open still in flight.
    fn open_transport(&mut self) {
        self.abort_pending_connect();

        if !self.network.current().is_connected {
            self.set_state(ChannelState::Reconnecting);
            self.wait_for_network();
            return;
        }

        let url = match channel_endpoint(&self.base, &self.kind, self.sessions.hint(), &self.query)
        {
            Ok(url) => url,
            Err(e) => {
                error!(channel = %self.kind, error = %e, "cannot derive endpoint");
                self.fail(self.scheduler.attempt(), e.to_string());
                return;
            }
        };

        self.connect_generation += 1;
        let generation = self.connect_generation;
        self.set_state(ChannelState::Connecting);
        debug!(channel = %self.kind, url = %url, generation, "opening transport");

        let connector = Arc::clone(&self.connector);
        let tx = self.connect_tx.clone();
        self.pending_connect = Some(tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = tx.send((generation, result));
        }));
    }

    async fn on_connect_result(&mut self, generation: u64, result: Result<C::Transport, LinkError>) {
        if generation != self.connect_generation || self.state != ChannelState::Connecting {
            debug!(channel = %self.kind, generation, "discarding superseded connect");
            if let Ok(mut stale) = result {
                stale.close().await;
            }
            return;
        }
        self.pending_connect = None;

        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.set_state(ChannelState::SessionPending);
                self.start_heartbeat();
                debug!(channel = %self.kind, "transport open, awaiting session");
            }
            Err(e) => self.on_transport_lost(e).await,
        }
    }

    async fn on_transport_frame(&mut self, frame: Option<Result<String, LinkError>>) {
        match frame {
            Some(Ok(text)) => self.on_text(&text).await,
            Some(Err(LinkError::MalformedFrame(reason))) => {
                warn!(channel = %self.kind, reason = %reason, "dropping malformed frame");
            }
            Some(Err(e)) => self.on_transport_lost(e).await,
            None => {
                self.on_transport_lost(LinkError::Transport("closed by peer".to_string()))
                    .await;
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %self.kind, error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame {
            InboundFrame::Ping => {
                if let Err(e) = self.write_control(&ControlFrame::pong()).await {
                    self.on_transport_lost(e).await;
                }
            }
            InboundFrame::Pong => {
                if let Some(heartbeat) = &self.heartbeat {
                    heartbeat.record_pong();
                }
                self.status.set_last_heartbeat_at(Some(Utc::now()));
            }
            session @ InboundFrame::Session(_) => self.on_session_frame(&session).await,
            InboundFrame::Application(app) => self.emit(ChannelEvent::Message(app)),
        }
    }

    async fn on_session_frame(&mut self, frame: &InboundFrame) {
        let (session_id, resumed) = match self.sessions.observe(frame) {
            SessionOutcome::NotSession => return,
            SessionOutcome::Malformed { reason } => {
                warn!(channel = %self.kind, reason = %reason, "bad session frame");
                self.on_transport_lost(LinkError::SessionEstablishment(reason))
                    .await;
                return;
            }
            SessionOutcome::New { session_id, .. } => (session_id, false),
            SessionOutcome::Resumed { session_id } => (session_id, true),
        };
        self.status.set_session_id(Some(session_id.clone()));

        if !resumed && !self.sessions.params().is_empty() {
            let config =
                ControlFrame::session_config(Some(session_id.clone()), self.sessions.params().clone());
            if let Err(e) = self.write_control(&config).await {
                self.on_transport_lost(e).await;
                return;
            }
        }

        if self.state != ChannelState::SessionPending {
            debug!(channel = %self.kind, session_id = %session_id, resumed, "session frame while attached");
            if !resumed {
                self.emit(ChannelEvent::Connected {
                    session_id,
                    resumed: false,
                });
            }
            return;
        }

        self.set_state(ChannelState::SessionAttached);
        self.reset_attempts();
        self.last_error = None;

        if !self.drain_queue().await {
            return;
        }

        let established_at = self.sessions.current().map(|s| s.established_at);
        info!(
            channel = %self.kind,
            session_id = %session_id,
            resumed,
            established_at = ?established_at,
            "session attached"
        );
        self.emit(ChannelEvent::Connected {
            session_id,
            resumed,
        });
    }

    async fn on_heartbeat(&mut self, signal: HeartbeatSignal) {
        let current = self.heartbeat.as_ref().map(HeartbeatHandle::generation);
        if current != Some(signal.generation()) {
            return;
        }

        match signal {
            HeartbeatSignal::Probe { .. } => {
                let missed = self.heartbeat.as_ref().map_or(0, HeartbeatHandle::missed_probes);
                debug!(channel = %self.kind, missed, "heartbeat probe");
                if let Err(e) = self.write_control(&ControlFrame::ping()).await {
                    self.on_transport_lost(e).await;
                }
            }
            HeartbeatSignal::Dead { missed, .. } => {
                warn!(channel = %self.kind, missed, "heartbeat lost, forcing reconnect");
                self.on_transport_lost(LinkError::HeartbeatTimeout { missed })
                    .await;
            }
        }
    }

    fn on_network_change(&mut self, observer_alive: bool) {
        let connected = !observer_alive || self.network_rx.borrow_and_update().is_connected;
        if !connected {
            return;
        }

        self.waiting_for_network = false;
        info!(channel = %self.kind, "connectivity restored");
        self.open_transport();
    }

    /// Tear down the transport and hand over to the scheduler. Errors no
    /// retry can fix park the channel in `Failed` instead.
    async fn on_transport_lost(&mut self, error: LinkError) {
        let was_open = self.state.is_open();

        self.stop_heartbeat();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }

        warn!(channel = %self.kind, state = %self.state, error = %error, "transport lost");
        let retryable = error.is_retryable();
        self.last_error = Some(error.to_string());
        if retryable {
            self.set_state(ChannelState::Reconnecting);
        }
        if was_open {
            self.emit(ChannelEvent::Disconnected {
                reason: error.to_string(),
            });
        }

        if !retryable {
            error!(channel = %self.kind, error = %error, "unrecoverable, not retrying");
            self.fail(self.scheduler.attempt(), error.to_string());
            return;
        }
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        match self.scheduler.on_failure() {
            ScheduleDecision::Retry { attempt, delay } => {
                self.status.set_reconnect_attempt(attempt);
                self.reconnect_at = Some(Instant::now() + delay);
                let max_attempts = self.scheduler.policy().max_attempts;
                info!(
                    channel = %self.kind,
                    attempt,
                    max_attempts = ?max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconnect scheduled"
                );
                self.emit(ChannelEvent::Reconnecting {
                    attempt,
                    max_attempts,
                    delay,
                });
            }
            ScheduleDecision::WaitForNetwork => self.wait_for_network(),
            ScheduleDecision::Exceeded { attempts } => {
                let last_error = self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| LinkError::MaxAttemptsExceeded { attempts }.to_string());
                error!(channel = %self.kind, attempts, last_error = %last_error, "giving up");
                self.fail(attempts, last_error);
            }
        }
    }

    /// Park in `Failed`; only a manual reconnect leaves it.
    fn fail(&mut self, attempts: u32, last_error: String) {
        self.set_state(ChannelState::Failed);
        self.emit(ChannelEvent::ConnectionFailed {
            attempts,
            last_error,
        });
    }

    fn wait_for_network(&mut self) {
        self.reconnect_at = None;
        // Connectivity may have returned since the caller looked.
        if self.network_rx.borrow_and_update().is_connected {
            self.network_rx.mark_changed();
        }
        if self.waiting_for_network {
            return;
        }
        self.waiting_for_network = true;
        info!(channel = %self.kind, "offline, waiting for connectivity");
        self.emit(ChannelEvent::WaitingForNetwork);
    }

    async fn enqueue_or_send(&mut self, message: QueuedMessage) {
        if self.state != ChannelState::SessionAttached || self.transport.is_none() {
            self.queue.enqueue(message);
            self.sync_queue_len();
            debug!(channel = %self.kind, queued = self.queue.len(), "message queued");
            return;
        }

        if let Err(e) = self.write_payload(&message.payload).await {
            self.queue.push_front(message);
            self.sync_queue_len();
            self.on_transport_lost(e).await;
        }
    }

    /// Send everything queued, oldest first. On a write failure the unsent
    /// messages go back to the head of the queue and the transport is
    /// treated as lost; returns `false` in that case.
    async fn drain_queue(&mut self) -> bool {
        debug_assert_eq!(
            self.state,
            ChannelState::SessionAttached,
            "queue drained outside SessionAttached"
        );

        if self.queue.is_empty() {
            return true;
        }
        let pending = self.queue.drain();
        let total = pending.len();

        let mut failure = None;
        for (index, message) in pending.iter().enumerate() {
            if let Err(e) = self.write_payload(&message.payload).await {
                failure = Some((index, e));
                break;
            }
        }

        if let Some((index, error)) = failure {
            for message in pending.into_iter().skip(index).rev() {
                self.queue.push_front(message);
            }
            self.sync_queue_len();
            self.on_transport_lost(error).await;
            return false;
        }

        self.sync_queue_len();
        debug!(channel = %self.kind, drained = total, "queue drained");
        true
    }

    async fn write_payload(&mut self, payload: &Value) -> Result<(), LinkError> {
        let text = encode_application(payload)?;
        self.write_text(text).await
    }

    async fn write_control(&mut self, frame: &ControlFrame) -> Result<(), LinkError> {
        let text = frame.to_json()?;
        self.write_text(text).await
    }

    async fn write_text(&mut self, text: String) -> Result<(), LinkError> {
        match self.transport.as_mut() {
            Some(transport) => transport.send(text).await,
            None => Err(LinkError::Transport("no open transport".to_string())),
        }
    }

    /// Close an open transport without scheduling a retry.
    async fn drop_transport(&mut self, reason: &str) {
        self.abort_pending_connect();
        self.stop_heartbeat();
        let was_open = self.state.is_open();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if was_open {
            self.emit(ChannelEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        if !self.heartbeat_config.enabled {
            return;
        }
        self.heartbeat_generation += 1;
        self.heartbeat = Some(HeartbeatHandle::start(
            &self.heartbeat_config,
            self.heartbeat_generation,
            self.heartbeat_tx.clone(),
        ));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
    }

    fn abort_pending_connect(&mut self) {
        if let Some(task) = self.pending_connect.take() {
            task.abort();
        }
        // Results already in flight are recognised as stale.
        self.connect_generation += 1;
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_at = None;
        self.waiting_for_network = false;
    }

    fn reset_attempts(&mut self) {
        self.scheduler.reset();
        self.status.set_reconnect_attempt(0);
    }

    fn sync_queue_len(&self) {
        self.status.set_queued(self.queue.len());
    }

    fn set_state(&mut self, to: ChannelState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.status.set_state(to);
        debug!(channel = %self.kind, from = %from, to = %to, "state change");
        self.emit(ChannelEvent::StateChanged { from, to });
    }

    fn emit(&self, event: ChannelEvent) {
        self.dispatcher.emit(&event);
    }
}

async fn next_transport_frame<T: Transport>(
    transport: &mut Option<T>,
) -> Option<Result<String, LinkError>> {
    match transport {
        Some(transport) => transport.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
