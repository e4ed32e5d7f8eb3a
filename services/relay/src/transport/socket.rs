//! Remote socket transport.
//!
//! Connects to an agent (or remote worker fronting one) over WebSocket and
//! speaks one versioned envelope per frame.  The handshake is a `hello`
//! request exchanging client identity and resume state for a connection id
//! and server capabilities.
//!
//! # Reconnect
//! On connection loss every pending waiter fails with `ConnectionLost` and
//! a reconnect controller starts: bounded attempts with exponential backoff
//! plus jitter.  When the server's `hello` response echoes the previous
//! connection id, the presented `lastSeqBySession` cursors were accepted and
//! the server replays the missed tail; otherwise resume tracking resets.
//! The hub only observes closure when the reconnect budget is exhausted (or
//! on explicit disconnect).

use super::{
    EVENT_BUFFER_CAPACITY, Pending, RpcResponse, TransportError, TransportEvent, await_response,
    decode_legacy_frame,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{
    ClientCommand, ClientInfo, Envelope, FrameDecode, HelloRequest, HelloResponse,
    PROTOCOL_VERSION, RequestFrame, ResumeInfo, ServerCapabilities, methods,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Deadline for the hello handshake on each (re)connect attempt.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect schedule: `min(max_delay, base * 2^(n-1) + U[0, 0.3 * base])`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Delay before reconnect attempt `n` (1-based).
pub fn backoff_delay(cfg: &ReconnectConfig, attempt: u32) -> Duration {
    let base = cfg.base.as_secs_f64();
    let exp = base * 2f64.powi(attempt.saturating_sub(1).min(31) as i32);
    let jitter = rand::random::<f64>() * 0.3 * base;
    Duration::from_secs_f64((exp + jitter).min(cfg.max_delay.as_secs_f64()))
}

#[derive(Default)]
struct ResumeTracking {
    connection_id: Option<String>,
    last_seq_by_session: HashMap<String, u64>,
}

struct ConnState {
    writer: WsWriter,
    connection_id: String,
    capabilities: ServerCapabilities,
    reader: tokio::task::JoinHandle<()>,
}

struct SocketInner {
    url: String,
    client_info: ClientInfo,
    reconnect: ReconnectConfig,
    pending: Pending,
    events_tx: broadcast::Sender<TransportEvent>,
    closed_tx: watch::Sender<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
    conn: Mutex<Option<ConnState>>,
    resume: StdMutex<ResumeTracking>,
}

/// Transport over a WebSocket to a remote agent.
#[derive(Clone)]
pub struct SocketTransport {
    inner: Arc<SocketInner>,
}

impl SocketTransport {
    pub fn new(url: String, client_info: ClientInfo, reconnect: ReconnectConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_CAPACITY);
        let (closed_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        SocketTransport {
            inner: Arc::new(SocketInner {
                url,
                client_info,
                reconnect,
                pending: Pending::default(),
                events_tx,
                closed_tx,
                shutdown_tx,
                conn: Mutex::new(None),
                resume: StdMutex::new(ResumeTracking::default()),
            }),
        }
    }

    /// Dial and perform the hello handshake.  Idempotent.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected().await {
            return Ok(());
        }
        let _ = self.inner.shutdown_tx.send(false);
        establish(&self.inner).await
    }

    /// Cancel in-flight waiters, close the socket, stop reconnecting.
    pub async fn disconnect(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let taken = self.inner.conn.lock().await.take();
        self.inner
            .pending
            .fail_all(&TransportError::ConnectionLost("shutdown".to_owned()));
        if let Some(mut state) = taken {
            state.reader.abort();
            let _ = state.writer.send(Message::Close(None)).await;
        }
        let _ = self.inner.closed_tx.send(Some("shutdown".to_owned()));
    }

    /// Send a request envelope and await the correlated response.
    pub async fn send_raw(
        &self,
        method: &str,
        session_id: Option<&str>,
        params: Option<serde_json::Value>,
        deadline: Option<Duration>,
    ) -> Result<RpcResponse, TransportError> {
        let id = Uuid::new_v4().to_string();
        let frame = Envelope::Request(RequestFrame {
            v: PROTOCOL_VERSION,
            id: id.clone(),
            session_id: session_id.map(ToOwned::to_owned),
            method: method.to_owned(),
            params,
        });
        let rx = self.inner.pending.register(&id, method);
        if let Err(e) = self.write_frame(&frame).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        await_response(&self.inner.pending, &id, rx, deadline).await
    }

    /// Forward a client command as a request envelope.
    ///
    /// The original command object becomes the request params, so nothing
    /// the client said is lost.  The acknowledgement is observed in the
    /// background; only write failures surface.
    pub async fn forward_command(
        &self,
        command: &ClientCommand,
        raw: &str,
        session_id: &str,
    ) -> Result<(), TransportError> {
        let params: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| TransportError::EncodingFailed(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let frame = Envelope::Request(RequestFrame {
            v: PROTOCOL_VERSION,
            id: id.clone(),
            session_id: Some(session_id.to_owned()),
            method: command.method().to_owned(),
            params: Some(params),
        });
        let rx = self.inner.pending.register(&id, command.method());
        if let Err(e) = self.write_frame(&frame).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        let inner = Arc::clone(&self.inner);
        let method = command.method().to_owned();
        tokio::spawn(async move {
            match await_response(&inner.pending, &id, rx, None).await {
                Ok(_) => {}
                Err(e) => debug!(method = %method, error = %e, "forwarded command ack"),
            }
        });
        Ok(())
    }

    async fn write_frame(&self, frame: &Envelope) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| TransportError::EncodingFailed(e.to_string()))?;
        let mut conn = self.inner.conn.lock().await;
        let state = conn.as_mut().ok_or(TransportError::NotConnected)?;
        state
            .writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn closed(&self) -> watch::Receiver<Option<String>> {
        self.inner.closed_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.inner
            .conn
            .lock()
            .await
            .as_ref()
            .map(|s| s.connection_id.clone())
    }

    /// Capabilities the server advertised in the last hello response.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .conn
            .lock()
            .await
            .as_ref()
            .map(|s| s.capabilities.clone())
    }
}

// ---------------------------------------------------------------------------
// Connection establishment
// ---------------------------------------------------------------------------

mod establish_impl {
    use super::{
        Arc, ConnState, ResumeInfo, SocketInner, StreamExt, TransportError, connect_async,
        hello_handshake, info, reader_loop,
    };
    use std::future::Future;
    use std::pin::Pin;

    // `establish` and `reconnect_loop` recursively depend on each other's
    // Send-ness through `tokio::spawn` (establish -> reader_loop ->
    // connection_lost -> reconnect_loop -> establish), which rustc's
    // opaque-type checker cannot resolve when `establish` returns `impl
    // Future` ("cannot check whether the hidden type of opaque type
    // satisfies auto traits"). Returning a boxed trait object here instead
    // gives `establish` a concrete, non-opaque return type, which breaks the
    // cycle for the auto-trait checker without changing behavior.
    pub(super) fn establish(
        inner: &Arc<SocketInner>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let (ws, _response) = connect_async(&inner.url)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            let presented = {
                let resume = inner.resume.lock().expect("resume lock");
                resume.connection_id.as_ref().map(|id| ResumeInfo {
                    connection_id: id.clone(),
                    last_seq_by_session: resume.last_seq_by_session.clone(),
                })
            };
            let presented_id = presented.as_ref().map(|r| r.connection_id.clone());

            let (mut ws, hello) = hello_handshake(ws, &inner.client_info, presented).await?;

            let resumed = presented_id.as_deref() == Some(hello.connection_id.as_str());
            {
                let mut resume = inner.resume.lock().expect("resume lock");
                if !resumed {
                    resume.last_seq_by_session.clear();
                }
                resume.connection_id = Some(hello.connection_id.clone());
            }

            let mut conn = inner.conn.lock().await;
            if conn.is_some() {
                // A concurrent connect won the slot; discard this socket.
                let _ = ws.close(None).await;
                return Ok(());
            }
            let (writer, reader) = ws.split();
            let reader = tokio::spawn(reader_loop(Arc::clone(inner), reader));
            info!(
                connection_id = %hello.connection_id,
                resumed,
                resume_supported = hello.capabilities.resume,
                replay_window_secs = hello.capabilities.replay_window_secs,
                "agent socket attached"
            );
            *conn = Some(ConnState {
                writer,
                connection_id: hello.connection_id,
                capabilities: hello.capabilities,
                reader,
            });
            Ok(())
        })
    }
}
use establish_impl::establish;

/// Send `hello` and read frames until its response arrives.
///
/// Events or heartbeats may interleave before the response; they are
/// ignored here (pre-handshake events are meaningless without a session
/// subscription).
async fn hello_handshake(
    mut ws: WsStream,
    client_info: &ClientInfo,
    resume: Option<ResumeInfo>,
) -> Result<(WsStream, HelloResponse), TransportError> {
    let id = Uuid::new_v4().to_string();
    let hello = Envelope::Request(RequestFrame {
        v: PROTOCOL_VERSION,
        id: id.clone(),
        session_id: None,
        method: methods::HELLO.to_owned(),
        params: Some(
            serde_json::to_value(HelloRequest {
                client_info: client_info.clone(),
                resume,
            })
            .map_err(|e| TransportError::EncodingFailed(e.to_string()))?,
        ),
    });
    let text = serde_json::to_string(&hello)
        .map_err(|e| TransportError::EncodingFailed(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + HELLO_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| TransportError::ConnectionFailed("hello timeout".to_owned()))?;
        match msg {
            None => {
                return Err(TransportError::ConnectionFailed(
                    "closed during hello".to_owned(),
                ));
            }
            Some(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
            Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                FrameDecode::Envelope(Envelope::Response(frame)) if frame.id == id => {
                    let response = RpcResponse {
                        ok: frame.ok,
                        result: frame.result,
                        error: frame.error,
                    };
                    let hello: HelloResponse = response.into_result()?;
                    return Ok((ws, hello));
                }
                _ => debug!("ignoring pre-handshake frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) => {
                return Err(TransportError::ConnectionFailed(
                    "closed during hello".to_owned(),
                ));
            }
            Some(Ok(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Reader loop and reconnect controller
// ---------------------------------------------------------------------------

async fn reader_loop(inner: Arc<SocketInner>, mut reader: WsReader) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let reason = loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            msg = reader.next() => {
                match msg {
                    None => break "connection closed".to_owned(),
                    Some(Err(e)) => break e.to_string(),
                    Some(Ok(Message::Text(text))) => handle_frame(&inner, &text),
                    Some(Ok(Message::Ping(data))) => {
                        if let Some(state) = inner.conn.lock().await.as_mut() {
                            let _ = state.writer.send(Message::Pong(data)).await;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "connection closed".to_owned());
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    connection_lost(&inner, reason).await;
}

fn handle_frame(inner: &Arc<SocketInner>, text: &str) {
    match Envelope::decode(text) {
        FrameDecode::Envelope(Envelope::Response(frame)) => {
            let response = RpcResponse {
                ok: frame.ok,
                result: frame.result,
                error: frame.error,
            };
            let inner = Arc::clone(inner);
            let id = frame.id;
            tokio::spawn(async move {
                inner.pending.complete_with_retry(&id, response).await;
            });
        }
        FrameDecode::Envelope(Envelope::Event(frame)) => {
            if let Some(seq) = frame.seq {
                let mut resume = inner.resume.lock().expect("resume lock");
                let cursor = resume
                    .last_seq_by_session
                    .entry(frame.session_id.clone())
                    .or_insert(0);
                if seq > *cursor {
                    *cursor = seq;
                }
            }
            let event = TransportEvent::new(
                Some(frame.session_id),
                frame.seq,
                frame.event_type,
                frame.payload,
            );
            let _ = inner.events_tx.send(event);
        }
        FrameDecode::Envelope(Envelope::Request(frame)) => {
            debug!(method = %frame.method, "ignoring request frame from agent");
        }
        FrameDecode::UnknownKind(kind) => {
            debug!(kind, "ignoring frame with unknown kind");
        }
        // Envelope decode failed: fall back to the legacy decoder so one
        // transport can service both agent flavours.
        FrameDecode::Malformed(detail) => match decode_legacy_frame(text) {
            Some(frame) => {
                if let Some((command, response)) = frame.response {
                    let inner_clone = Arc::clone(inner);
                    tokio::spawn(async move {
                        inner_clone
                            .pending
                            .complete_with_retry(&command, response)
                            .await;
                    });
                }
                let _ = inner.events_tx.send(frame.event);
            }
            None => warn!(detail, "malformed frame skipped"),
        },
    }
}

async fn connection_lost(inner: &Arc<SocketInner>, reason: String) {
    warn!(reason = %reason, "agent socket lost");
    inner.conn.lock().await.take();
    inner
        .pending
        .fail_all(&TransportError::ConnectionLost(reason));

    if *inner.shutdown_tx.borrow() {
        return;
    }
    tokio::spawn(reconnect_loop(Arc::clone(inner)));
}

async fn reconnect_loop(inner: Arc<SocketInner>) {
    let cfg = inner.reconnect.clone();
    let mut shutdown = inner.shutdown_tx.subscribe();
    for attempt in 1..=cfg.max_attempts {
        let delay = backoff_delay(&cfg, attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
        match establish(&inner).await {
            Ok(()) => {
                info!(attempt, "reconnected to agent socket");
                return;
            }
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
    warn!(
        attempts = cfg.max_attempts,
        "reconnect budget exhausted; channel closed"
    );
    let _ = inner
        .closed_tx
        .send(Some("reconnect attempts exhausted".to_owned()));
}
