//! Per-session hub: one sandbox channel, many clients.
//!
//! The hub owns the only attachment to a session's sandbox, fans agent
//! events out to every connected client, journals them first so resuming
//! clients can replay, elects a controller for interactive extension-UI
//! prompts, and releases the channel after a grace period once the last
//! client leaves.
//!
//! All hub state lives behind one mutex; the event pump, client commands,
//! and lifecycle transitions serialize on it, which is what makes the
//! ordering guarantees hold: events are journaled before the lock is taken
//! and broadcast under it, so every client observes a prefix of the journal.

use crate::environment::EnvironmentService;
use crate::journal::Journal;
use crate::sandbox::SandboxManager;
use crate::store::{SessionStatus, SharedStore};
use crate::transport::{Transport, TransportEvent};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use relay_protocol::{
    ClientCommand, EventFrame, ExtensionUiMethod, PROTOCOL_VERSION, RpcEvent, SandboxStatus,
    ServerFrame, close_codes,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Grace period between the last client leaving and channel release.
pub const DETACH_GRACE_MS: u64 = 15_000;

/// Bound on each client's outbound queue; overflow drops the client.
pub const CLIENT_OUTBOUND_CAPACITY: usize = 256;

static CONNECT_COUNTER: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Client plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Whether the client can render interactive extension-UI prompts.
    pub extension_ui: bool,
}

/// Frames queued toward one client connection.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A relay-emitted frame.
    Server(ServerFrame),
    /// A journaled agent event (seq always set).
    Event(EventFrame),
}

/// Instruction to the connection task to close the socket.
#[derive(Debug)]
pub struct CloseCommand {
    pub code: u16,
    pub reason: String,
    /// Error frame to send before closing, if any.
    pub frame: Option<ServerFrame>,
}

/// What the edge hands the hub when a client connects.
pub struct NewClient {
    pub client_id: String,
    pub capabilities: ClientCapabilities,
    pub outbound_tx: mpsc::Sender<OutboundFrame>,
    pub kill_tx: oneshot::Sender<CloseCommand>,
}

enum DeliveryState {
    /// Connected but not yet past `connected`/replay; live events buffer
    /// here and flush after replay so ordering stays contiguous.
    Joining(Vec<OutboundFrame>),
    Ready,
}

struct ClientHandle {
    client_id: String,
    capabilities: ClientCapabilities,
    connected_at: u64,
    state: DeliveryState,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    kill_tx: Option<oneshot::Sender<CloseCommand>>,
}

impl ClientHandle {
    fn kill(&mut self, command: CloseCommand) {
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(command);
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a client could not be admitted.  `Clone` because concurrent
/// `add_client` calls share one attach future.
#[derive(Debug, Clone, Error)]
pub enum AttachError {
    #[error("Session not found")]
    SessionNotFound,
    #[error("Session is archived")]
    SessionArchived,
    #[error("Session not active")]
    SessionNotActive,
    #[error("Sandbox not provisioned")]
    SandboxNotProvisioned,
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("hub is closed")]
    HubClosed,
    #[error("storage failure: {0}")]
    Storage(String),
}

impl AttachError {
    /// WebSocket close code surfaced to the rejected client.
    pub fn close_code(&self) -> u16 {
        match self {
            AttachError::SessionNotFound | AttachError::SessionArchived => {
                close_codes::SESSION_NOT_FOUND
            }
            AttachError::SessionNotActive
            | AttachError::SandboxNotProvisioned
            | AttachError::AttachFailed(_) => close_codes::SESSION_NOT_ACTIVE,
            AttachError::HubClosed | AttachError::Storage(_) => close_codes::INTERNAL_ERROR,
        }
    }
}

/// Why a client command was rejected.  Sent only to the offending client.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown client")]
    UnknownClient,
    #[error("Only the controller client can send extension_ui_response")]
    NotController,
    #[error("no channel attached")]
    ChannelDetached,
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("forward failed: {0}")]
    Forward(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        use relay_protocol::error_codes;
        match self {
            CommandError::UnknownClient => error_codes::UNKNOWN_CLIENT,
            CommandError::NotController => error_codes::NOT_CONTROLLER,
            CommandError::ChannelDetached => error_codes::CHANNEL_DETACHED,
            CommandError::Malformed(_)
            | CommandError::Forward(_)
            | CommandError::Storage(_) => error_codes::INTERNAL_ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// Context and hub
// ---------------------------------------------------------------------------

/// Process-scoped collaborators, injected explicitly.
#[derive(Clone)]
pub struct HubContext {
    pub store: SharedStore,
    pub journal: Journal,
    pub sandbox: Arc<dyn SandboxManager>,
    pub environments: Arc<dyn EnvironmentService>,
}

/// Tunables; defaults match production behaviour, tests shrink them.
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub detach_grace: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        HubOptions {
            detach_grace: Duration::from_millis(DETACH_GRACE_MS),
        }
    }
}

type AttachShared = Shared<BoxFuture<'static, Result<(), AttachError>>>;

struct HubInner {
    clients: HashMap<String, ClientHandle>,
    channel: Option<Arc<Transport>>,
    attach_in_progress: Option<AttachShared>,
    detach_timer: Option<tokio::task::JoinHandle<()>>,
    event_pump: Option<tokio::task::JoinHandle<()>>,
    close_watch: Option<tokio::task::JoinHandle<()>>,
    controller_client_id: Option<String>,
    activator_client_id: Option<String>,
    last_writer_client_id: Option<String>,
    closed: bool,
}

/// The per-session coordinator.
pub struct Hub {
    session_id: String,
    ctx: HubContext,
    options: HubOptions,
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new(session_id: String, ctx: HubContext, options: HubOptions) -> Arc<Self> {
        Arc::new(Hub {
            session_id,
            ctx,
            options,
            inner: Mutex::new(HubInner {
                clients: HashMap::new(),
                channel: None,
                attach_in_progress: None,
                detach_timer: None,
                event_pump: None,
                close_watch: None,
                controller_client_id: None,
                activator_client_id: None,
                last_writer_client_id: None,
                closed: false,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    // -----------------------------------------------------------------------
    // Client lifecycle
    // -----------------------------------------------------------------------

    /// Admit a client: cancel any pending detach, ensure the sandbox channel
    /// is attached, send `connected`, and replay the missed span.
    pub async fn add_client(
        self: &Arc<Self>,
        client: NewClient,
        last_seq: u64,
    ) -> Result<(), AttachError> {
        let client_id = client.client_id.clone();

        let attach = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(AttachError::HubClosed);
            }
            if let Some(timer) = inner.detach_timer.take() {
                timer.abort();
            }
            inner.clients.insert(
                client_id.clone(),
                ClientHandle {
                    client_id: client_id.clone(),
                    capabilities: client.capabilities,
                    connected_at: CONNECT_COUNTER.fetch_add(1, Ordering::Relaxed),
                    state: DeliveryState::Joining(Vec::new()),
                    outbound_tx: client.outbound_tx,
                    kill_tx: Some(client.kill_tx),
                },
            );
            self.elect_controller(&mut inner);
            self.ensure_attach_started(&mut inner)
        };

        if let Err(e) = attach.await {
            let mut inner = self.inner.lock().await;
            if let Some(mut handle) = inner.clients.remove(&client_id) {
                handle.kill(CloseCommand {
                    code: e.close_code(),
                    reason: e.to_string(),
                    frame: None,
                });
            }
            self.elect_controller(&mut inner);
            // Remaining clients learn the sandbox is unreachable.
            self.broadcast_frame(
                &mut inner,
                ServerFrame::SandboxStatus {
                    status: SandboxStatus::Stopped,
                    message: Some(e.to_string()),
                },
            );
            if inner.clients.is_empty() {
                self.start_detach_timer(&mut inner);
            }
            return Err(e);
        }

        // Journal reads happen outside the hub lock so one client resuming
        // a large backlog never stalls command routing or fan-out for the
        // rest of the session.  Ordering still holds: the client stays in
        // its joining state, so live events land in its buffer and flush
        // after `replay_end`, in seq order.
        let (max_seq, frames) = match self.greeting_frames(last_seq).await {
            Ok(greeting) => greeting,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if let Some(mut handle) = inner.clients.remove(&client_id) {
                    handle.kill(CloseCommand {
                        code: e.close_code(),
                        reason: e.to_string(),
                        frame: None,
                    });
                }
                self.elect_controller(&mut inner);
                if inner.clients.is_empty() && !inner.closed {
                    self.start_detach_timer(&mut inner);
                }
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.clients.get(&client_id) else {
            // Removed while attaching (disconnect raced admission).
            return Ok(());
        };
        let outbound = handle.outbound_tx.clone();

        let mut overflowed = false;
        for frame in frames {
            if outbound.try_send(frame).is_err() {
                overflowed = true;
                break;
            }
        }

        // Flush events buffered while joining; anything at or below the
        // snapshot was covered by replay (or predates this client).
        if let Some(handle) = inner.clients.get_mut(&client_id) {
            let buffered =
                match std::mem::replace(&mut handle.state, DeliveryState::Ready) {
                    DeliveryState::Joining(buffered) => buffered,
                    DeliveryState::Ready => Vec::new(),
                };
            for frame in buffered {
                let skip = matches!(
                    &frame,
                    OutboundFrame::Event(ev) if ev.seq.is_some_and(|s| s <= max_seq)
                );
                if skip {
                    continue;
                }
                if !overflowed && outbound.try_send(frame).is_err() {
                    overflowed = true;
                }
            }
        }

        if overflowed {
            self.drop_slow_consumer(&mut inner, &client_id);
        }
        Ok(())
    }

    /// Build the `connected` frame plus, for a resuming client, the replay
    /// span bracketed by `replay_start`/`replay_end`.  Returns the journal
    /// high-water mark the frames were computed against.
    async fn greeting_frames(
        self: &Arc<Self>,
        last_seq: u64,
    ) -> Result<(u64, Vec<OutboundFrame>), AttachError> {
        let max_seq = self
            .ctx
            .journal
            .get_max_seq(&self.session_id)
            .await
            .map_err(|e| AttachError::Storage(e.to_string()))?;

        let mut frames = vec![OutboundFrame::Server(ServerFrame::Connected {
            session_id: self.session_id.clone(),
            last_seq: max_seq,
        })];

        if last_seq > 0 && last_seq < max_seq {
            frames.push(OutboundFrame::Server(ServerFrame::ReplayStart {
                from_seq: last_seq,
                to_seq: max_seq,
            }));
            let events = self
                .ctx
                .journal
                .get_after_seq(&self.session_id, last_seq, None)
                .await
                .map_err(|e| AttachError::Storage(e.to_string()))?;
            // Cap at the advertised span; anything appended since the
            // snapshot is delivered live, after `replay_end`.
            for event in events.into_iter().filter(|e| e.seq <= max_seq) {
                match serde_json::from_str(&event.payload_json) {
                    Ok(payload) => frames.push(OutboundFrame::Event(EventFrame {
                        v: PROTOCOL_VERSION,
                        session_id: self.session_id.clone(),
                        seq: Some(event.seq),
                        event_type: event.event_type,
                        payload: Some(payload),
                    })),
                    Err(e) => {
                        // Malformed stored payloads never abort replay.
                        warn!(
                            session_id = %self.session_id,
                            seq = event.seq,
                            error = %e,
                            "skipping malformed journaled payload during replay"
                        );
                    }
                }
            }
            frames.push(OutboundFrame::Server(ServerFrame::ReplayEnd));
        }

        Ok((max_seq, frames))
    }

    /// Remove a client; the last one out starts the detach grace timer.
    pub async fn remove_client(self: &Arc<Self>, client_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.clients.remove(client_id).is_none() {
            return;
        }
        if inner.controller_client_id.as_deref() == Some(client_id) {
            inner.controller_client_id = None;
        }
        self.elect_controller(&mut inner);
        if inner.clients.is_empty() && !inner.closed {
            self.start_detach_timer(&mut inner);
        }
    }

    /// Update a client's capabilities (the controller may change).
    pub async fn set_client_capabilities(
        self: &Arc<Self>,
        client_id: &str,
        capabilities: ClientCapabilities,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.clients.get_mut(client_id) {
            handle.capabilities = capabilities;
            self.elect_controller(&mut inner);
        }
    }

    /// Record which client activated the session (election priority 2).
    pub async fn set_activator_client(self: &Arc<Self>, client_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.activator_client_id = Some(client_id.to_owned());
        self.elect_controller(&mut inner);
    }

    /// Forget activator/writer/controller state (used when idling).
    pub async fn clear_client_state(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.activator_client_id = None;
        inner.last_writer_client_id = None;
        inner.controller_client_id = None;
        self.elect_controller(&mut inner);
    }

    pub async fn controller_client_id(&self) -> Option<String> {
        self.inner.lock().await.controller_client_id.clone()
    }

    // -----------------------------------------------------------------------
    // Client commands
    // -----------------------------------------------------------------------

    /// Route one command from a client toward the agent.
    ///
    /// `raw` is the command exactly as the client sent it; the agent
    /// receives that encoding, not a re-serialization.
    pub async fn handle_client_command(
        self: &Arc<Self>,
        client_id: &str,
        raw: &str,
    ) -> Result<(), CommandError> {
        // Unknown command kinds decode to their lossless carry variant and
        // forward like any other command.
        let command =
            ClientCommand::decode(raw).map_err(|e| CommandError::Malformed(e.to_string()))?;

        let channel = {
            let mut inner = self.inner.lock().await;
            let Some(handle) = inner.clients.get(client_id) else {
                return Err(CommandError::UnknownClient);
            };
            let has_extension_ui = handle.capabilities.extension_ui;

            if command.is_writer_command() && has_extension_ui {
                inner.last_writer_client_id = Some(client_id.to_owned());
                self.elect_controller(&mut inner);
            }

            if matches!(command, ClientCommand::ExtensionUiResponse { .. })
                && inner.controller_client_id.as_deref() != Some(client_id)
            {
                return Err(CommandError::NotController);
            }

            inner.channel.clone()
        };

        // Prompts become part of history: journal before forwarding, and
        // remember the first one as the session's first user message.
        if let ClientCommand::Prompt { message } = &command {
            self.ctx
                .journal
                .append(&self.session_id, "prompt", raw)
                .await
                .map_err(|e| CommandError::Storage(e.to_string()))?;
            let store = self.ctx.store.lock().await;
            if let Err(e) = store.set_first_user_message_if_absent(&self.session_id, message) {
                warn!(session_id = %self.session_id, error = %e, "first-prompt hook failed");
            }
        }

        let Some(channel) = channel else {
            return Err(CommandError::ChannelDetached);
        };
        channel
            .forward_command(&command, raw, &self.session_id)
            .await
            .map_err(|e| CommandError::Forward(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Sandbox events
    // -----------------------------------------------------------------------

    async fn handle_sandbox_event(self: &Arc<Self>, event: TransportEvent) {
        // Some legacy agents omit the session id; a hub only ever serves one.
        if let Some(sid) = &event.session_id {
            if sid != &self.session_id {
                debug!(
                    event_session = %sid,
                    hub_session = %self.session_id,
                    "dropping event for foreign session"
                );
                return;
            }
        }

        // Journal first: an event without a seq cannot be forwarded.
        let seq = match self
            .ctx
            .journal
            .append(&self.session_id, &event.event_type, &event.raw_payload)
            .await
        {
            Ok(seq) => seq,
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    event_type = %event.event_type,
                    error = %e,
                    "journal append failed; event dropped"
                );
                return;
            }
        };

        self.run_server_hooks(&event).await;

        let frame = EventFrame {
            v: PROTOCOL_VERSION,
            session_id: self.session_id.clone(),
            seq: Some(seq),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        };

        {
            let mut inner = self.inner.lock().await;
            match &event.event {
                RpcEvent::ExtensionUiRequest { .. } => {
                    // Interactive prompts route to the controller alone.
                    match inner.controller_client_id.clone() {
                        Some(controller) => {
                            self.deliver_to(&mut inner, &controller, OutboundFrame::Event(frame));
                        }
                        None => warn!(
                            session_id = %self.session_id,
                            seq,
                            "extension_ui_request with no controller; dropped"
                        ),
                    }
                }
                _ => self.broadcast_event(&mut inner, frame),
            }
        }

        let store = self.ctx.store.lock().await;
        if let Err(e) = store.touch(&self.session_id) {
            warn!(session_id = %self.session_id, error = %e, "touch failed");
        }
    }

    /// Static side-effects run before forwarding.  Best-effort: failures are
    /// logged and never block journaling or delivery.
    async fn run_server_hooks(self: &Arc<Self>, event: &TransportEvent) {
        match &event.event {
            RpcEvent::Response {
                command: Some(command),
            } if command == "get_state" => {
                let name = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("sessionName"))
                    .and_then(|n| n.as_str());
                if let Some(name) = name {
                    let store = self.ctx.store.lock().await;
                    if let Err(e) = store.set_name(&self.session_id, name) {
                        warn!(session_id = %self.session_id, error = %e, "get_state name hook failed");
                    }
                }
            }
            RpcEvent::ExtensionUiRequest {
                method: ExtensionUiMethod::SetTitle,
            } => {
                let title = event
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("title"))
                    .and_then(|t| t.as_str());
                if let Some(title) = title {
                    let store = self.ctx.store.lock().await;
                    if let Err(e) = store.set_name(&self.session_id, title) {
                        warn!(session_id = %self.session_id, error = %e, "setTitle hook failed");
                    }
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Attach / detach
    // -----------------------------------------------------------------------

    fn ensure_attach_started(self: &Arc<Self>, inner: &mut HubInner) -> AttachShared {
        if inner.channel.is_some() {
            return futures_util::future::ready(Ok(())).boxed().shared();
        }
        if let Some(attach) = &inner.attach_in_progress {
            return attach.clone();
        }
        let hub = Arc::clone(self);
        let attach: AttachShared = async move {
            let result = hub.attach_channel().await;
            let mut inner = hub.inner.lock().await;
            inner.attach_in_progress = None;
            if let Err(e) = &result {
                debug!(session_id = %hub.session_id, error = %e, "attach failed");
            }
            result
        }
        .boxed()
        .shared();
        inner.attach_in_progress = Some(attach.clone());
        attach
    }

    async fn attach_channel(self: &Arc<Self>) -> Result<(), AttachError> {
        let session = {
            let store = self.ctx.store.lock().await;
            store
                .get_session(&self.session_id)
                .map_err(|e| AttachError::Storage(e.to_string()))?
        };
        let session = session.ok_or(AttachError::SessionNotFound)?;
        match session.status {
            SessionStatus::Archived => return Err(AttachError::SessionArchived),
            SessionStatus::Active => {}
            _ => return Err(AttachError::SessionNotActive),
        }
        let (provider, provider_id) = match (&session.sandbox_provider, &session.sandbox_provider_id)
        {
            (Some(p), Some(id)) => (p.clone(), id.clone()),
            _ => return Err(AttachError::SandboxNotProvisioned),
        };

        // Chat sessions may run without an environment.
        let env = match &session.environment_id {
            Some(env_id) => {
                let env = self.ctx.environments.env_config(env_id).await;
                if env.is_none() {
                    warn!(session_id = %self.session_id, env_id, "unknown environment; attaching without config");
                }
                env
            }
            None => None,
        };

        let transport = self
            .ctx
            .sandbox
            .attach_session(&provider, &provider_id, env)
            .await
            .map_err(|e| {
                // Unrecoverable attach failure marks the session errored
                // until an external activation resets it.
                let ctx = self.ctx.clone();
                let session_id = self.session_id.clone();
                tokio::spawn(async move {
                    let store = ctx.store.lock().await;
                    if let Err(se) = store.set_status(&session_id, SessionStatus::Error) {
                        warn!(session_id = %session_id, error = %se, "failed to mark session errored");
                    }
                });
                AttachError::AttachFailed(e.to_string())
            })?;

        let mut inner = self.inner.lock().await;
        if inner.closed {
            drop(inner);
            transport.disconnect().await;
            return Err(AttachError::HubClosed);
        }
        let events = transport.events();
        let closed = transport.closed();
        inner.event_pump = Some(tokio::spawn(event_pump(Arc::clone(self), events)));
        inner.close_watch = Some(tokio::spawn(close_watch(Arc::clone(self), closed)));
        inner.channel = Some(transport);
        info!(session_id = %self.session_id, "sandbox channel attached");
        Ok(())
    }

    fn start_detach_timer(self: &Arc<Self>, inner: &mut HubInner) {
        if inner.detach_timer.is_some() {
            return;
        }
        let hub = Arc::clone(self);
        let grace = self.options.detach_grace;
        inner.detach_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.detach_if_idle().await;
        }));
        debug!(session_id = %self.session_id, grace_ms = self.options.detach_grace.as_millis() as u64, "detach timer started");
    }

    /// Release the channel if the grace period passed with no clients.
    async fn detach_if_idle(self: &Arc<Self>) {
        let channel = {
            let mut inner = self.inner.lock().await;
            inner.detach_timer = None;
            if !inner.clients.is_empty() || inner.closed {
                return;
            }
            if let Some(pump) = inner.event_pump.take() {
                pump.abort();
            }
            if let Some(watch) = inner.close_watch.take() {
                watch.abort();
            }
            inner.channel.take()
        };
        if let Some(channel) = channel {
            channel.disconnect().await;
            info!(session_id = %self.session_id, "channel released after detach grace");
        }
    }

    /// The sandbox side closed underneath us: keep the clients (they may
    /// reconnect after reactivation), drop the channel, tell everyone.
    async fn handle_channel_closed(self: &Arc<Self>, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.channel.is_none() {
            return;
        }
        if let Some(pump) = inner.event_pump.take() {
            pump.abort();
        }
        if let Some(watch) = inner.close_watch.take() {
            watch.abort();
        }
        inner.channel = None;
        warn!(session_id = %self.session_id, reason = %reason, "sandbox channel closed");
        self.broadcast_frame(
            &mut inner,
            ServerFrame::SandboxStatus {
                status: SandboxStatus::Stopped,
                message: Some(reason),
            },
        );
    }

    /// Terminal shutdown.
    pub async fn close(self: &Arc<Self>) {
        let channel = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some(timer) = inner.detach_timer.take() {
                timer.abort();
            }
            if let Some(pump) = inner.event_pump.take() {
                pump.abort();
            }
            if let Some(watch) = inner.close_watch.take() {
                watch.abort();
            }
            for (_, mut handle) in inner.clients.drain() {
                handle.kill(CloseCommand {
                    code: close_codes::NORMAL,
                    reason: "hub closed".to_owned(),
                    frame: None,
                });
            }
            inner.controller_client_id = None;
            inner.activator_client_id = None;
            inner.last_writer_client_id = None;
            inner.attach_in_progress = None;
            inner.channel.take()
        };
        if let Some(channel) = channel {
            channel.disconnect().await;
        }
        info!(session_id = %self.session_id, "hub closed");
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Broadcast a relay frame (`sandbox_status` and friends) to all clients.
    pub async fn broadcast_server_frame(self: &Arc<Self>, frame: ServerFrame) {
        let mut inner = self.inner.lock().await;
        self.broadcast_frame(&mut inner, frame);
    }

    fn broadcast_frame(self: &Arc<Self>, inner: &mut HubInner, frame: ServerFrame) {
        let ids: Vec<String> = inner.clients.keys().cloned().collect();
        for id in ids {
            self.deliver_to(inner, &id, OutboundFrame::Server(frame.clone()));
        }
    }

    fn broadcast_event(self: &Arc<Self>, inner: &mut HubInner, frame: EventFrame) {
        let ids: Vec<String> = inner.clients.keys().cloned().collect();
        for id in ids {
            self.deliver_to(inner, &id, OutboundFrame::Event(frame.clone()));
        }
    }

    fn deliver_to(self: &Arc<Self>, inner: &mut HubInner, client_id: &str, frame: OutboundFrame) {
        let Some(handle) = inner.clients.get_mut(client_id) else {
            return;
        };
        let overflow = match &mut handle.state {
            DeliveryState::Joining(buffer) => {
                if buffer.len() >= CLIENT_OUTBOUND_CAPACITY {
                    true
                } else {
                    buffer.push(frame);
                    false
                }
            }
            DeliveryState::Ready => handle.outbound_tx.try_send(frame).is_err(),
        };
        if overflow {
            self.drop_slow_consumer(inner, client_id);
        }
    }

    /// A full outbound queue means the client cannot keep up; drop it rather
    /// than back-pressure the hub.
    fn drop_slow_consumer(self: &Arc<Self>, inner: &mut HubInner, client_id: &str) {
        if let Some(mut handle) = inner.clients.remove(client_id) {
            warn!(
                session_id = %self.session_id,
                client_id,
                "outbound queue overflow; dropping slow consumer"
            );
            handle.kill(CloseCommand {
                code: close_codes::INTERNAL_ERROR,
                reason: "slow consumer".to_owned(),
                frame: Some(ServerFrame::Error {
                    code: relay_protocol::error_codes::SLOW_CONSUMER.to_owned(),
                    message: "outbound queue overflow".to_owned(),
                }),
            });
        }
        if inner.controller_client_id.as_deref() == Some(client_id) {
            inner.controller_client_id = None;
        }
        self.elect_controller(inner);
        if inner.clients.is_empty() && !inner.closed {
            self.start_detach_timer(inner);
        }
    }

    // -----------------------------------------------------------------------
    // Controller election
    // -----------------------------------------------------------------------

    /// Deterministic priority: last writer, then activator, then the most
    /// recently connected eligible client.  Only `extension_ui` clients are
    /// eligible.
    fn elect_controller(self: &Arc<Self>, inner: &mut HubInner) {
        let eligible = |id: &Option<String>, inner: &HubInner| -> Option<String> {
            id.as_ref()
                .filter(|id| {
                    inner
                        .clients
                        .get(*id)
                        .is_some_and(|c| c.capabilities.extension_ui)
                })
                .cloned()
        };

        let elected = eligible(&inner.last_writer_client_id, inner)
            .or_else(|| eligible(&inner.activator_client_id, inner))
            .or_else(|| {
                inner
                    .clients
                    .values()
                    .filter(|c| c.capabilities.extension_ui)
                    .max_by_key(|c| c.connected_at)
                    .map(|c| c.client_id.clone())
            });

        if elected != inner.controller_client_id {
            debug!(
                session_id = %self.session_id,
                from = ?inner.controller_client_id,
                to = ?elected,
                "controller changed"
            );
            inner.controller_client_id = elected;
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn event_pump(hub: Arc<Hub>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => hub.handle_sandbox_event(event).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(session_id = %hub.session_id, skipped = n, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn close_watch(hub: Arc<Hub>, mut closed: tokio::sync::watch::Receiver<Option<String>>) {
    loop {
        if closed.changed().await.is_err() {
            return;
        }
        let reason = closed.borrow().clone();
        if let Some(reason) = reason {
            hub.handle_channel_closed(reason).await;
            return;
        }
    }
}
