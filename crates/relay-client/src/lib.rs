// relay-client: resumable client for the agent relay.
//
// Wraps one WebSocket per session with the reconnect/resume policy the
// relay mirrors: a stable client id, the last seen sequence number per
// session, and bounded exponential backoff with jitter.  Callers consume a
// stream of `ClientEvent`s and never see individual socket lifetimes.
//
// State machine:
//
// ```text
// Disconnected ── connect() ─► Connecting ─ open OK ─► Connected
//       ▲                           │
//       │                           └ open fail ─► Disconnected
//       └──── budget exhausted ◄─ Reconnecting(n) ◄─ channel drop
// ```

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ClientCommand, Envelope, EventFrame, FrameDecode, ServerFrame};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("client is disconnected")]
    Disconnected,
}

/// Bounded exponential backoff with jitter:
/// `delay(n) = min(max_delay, base * 2^(n-1) + U[0, 0.3 * base])`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let exp = base * 2f64.powi(attempt.saturating_sub(1).min(31) as i32);
        let jitter = rand::random::<f64>() * 0.3 * base;
        Duration::from_secs_f64((exp + jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// How to reach the relay and who we are.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:8787`.
    pub base_url: String,
    /// Stable client identity, re-presented on every reconnect.
    pub client_id: String,
    /// Whether this client renders extension-UI prompts.
    pub extension_ui: bool,
    /// Controller-election hint for the client that activated the session.
    pub activator: bool,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            extension_ui: false,
            activator: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// What a session subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Relay accepted us; `last_seq` is the journal high-water mark.
    Connected { session_id: String, last_seq: u64 },
    /// A relay frame (replay brackets, sandbox status, errors).
    Frame(ServerFrame),
    /// A journaled agent event.
    Event(EventFrame),
    /// The socket dropped; attempt `attempt` starts after backoff.
    Reconnecting { attempt: u32 },
    /// Reconnect budget exhausted (or explicit disconnect).
    Disconnected { reason: String },
}

fn session_url(config: &ClientConfig, session_id: &str, last_seq: u64) -> String {
    format!(
        "{}/ws/v1/sessions/{}?clientId={}&lastSeq={}&extensionUi={}&activator={}",
        config.base_url.trim_end_matches('/'),
        session_id,
        config.client_id,
        last_seq,
        config.extension_ui,
        config.activator,
    )
}

/// One resumable session subscription.
pub struct SessionClient {
    cmd_tx: mpsc::Sender<String>,
    events_rx: mpsc::Receiver<ClientEvent>,
    shutdown_tx: watch::Sender<bool>,
    last_seq: Arc<AtomicU64>,
    driver: tokio::task::JoinHandle<()>,
}

impl SessionClient {
    /// Open the initial connection; fails fast if the relay is unreachable
    /// or rejects the attach.
    pub async fn connect(
        config: ClientConfig,
        session_id: impl Into<String>,
        last_seq: u64,
    ) -> Result<Self, ClientError> {
        let session_id = session_id.into();
        let last_seq = Arc::new(AtomicU64::new(last_seq));

        let url = session_url(&config, &session_id, last_seq.load(Ordering::SeqCst));
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<String>(64);
        let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(drive(
            config,
            session_id,
            ws,
            cmd_rx,
            events_tx,
            shutdown_rx,
            Arc::clone(&last_seq),
        ));

        Ok(SessionClient {
            cmd_tx,
            events_rx,
            shutdown_tx,
            last_seq,
            driver,
        })
    }

    /// Send a command to the session.
    pub async fn send(&self, command: &ClientCommand) -> Result<(), ClientError> {
        let text =
            serde_json::to_string(command).map_err(|e| ClientError::Encoding(e.to_string()))?;
        self.cmd_tx
            .send(text)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Next event; `None` once the driver has stopped.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events_rx.recv().await
    }

    /// Highest journal sequence observed for this session.
    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    /// Cancel any pending reconnect delay and close the connection.
    pub async fn disconnect(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.driver.await;
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn drive(
    config: ClientConfig,
    session_id: String,
    mut ws: WsStream,
    mut cmd_rx: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    last_seq: Arc<AtomicU64>,
) {
    'connection: loop {
        // Pump one live connection until it drops.
        let drop_reason = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws.close(None).await;
                        let _ = events_tx
                            .send(ClientEvent::Disconnected { reason: "disconnect requested".to_owned() })
                            .await;
                        return;
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(text) => {
                            if let Err(e) = ws.send(Message::Text(text.into())).await {
                                break e.to_string();
                            }
                        }
                        None => {
                            // Handle dropped without disconnect(); stop quietly.
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                }
                msg = ws.next() => {
                    match msg {
                        None => break "connection closed".to_owned(),
                        Some(Err(e)) => break e.to_string(),
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = decode_inbound(&text, &last_seq) {
                                if events_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
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

        debug!(session_id = %session_id, reason = %drop_reason, "session socket dropped");

        // Reconnect with bounded backoff, presenting the resume cursor.
        for attempt in 1..=config.retry.max_attempts {
            if events_tx
                .send(ClientEvent::Reconnecting { attempt })
                .await
                .is_err()
            {
                return;
            }
            let delay = config.retry.delay(attempt);
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = events_tx
                            .send(ClientEvent::Disconnected { reason: "disconnect requested".to_owned() })
                            .await;
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let url = session_url(&config, &session_id, last_seq.load(Ordering::SeqCst));
            match connect_async(&url).await {
                Ok((new_ws, _)) => {
                    ws = new_ws;
                    continue 'connection;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }

        let _ = events_tx
            .send(ClientEvent::Disconnected {
                reason: "reconnect attempts exhausted".to_owned(),
            })
            .await;
        return;
    }
}

/// Classify one inbound frame: envelopes carry `kind`, relay frames `type`.
fn decode_inbound(text: &str, last_seq: &AtomicU64) -> Option<ClientEvent> {
    match Envelope::decode(text) {
        FrameDecode::Envelope(Envelope::Event(frame)) => {
            if let Some(seq) = frame.seq {
                last_seq.fetch_max(seq, Ordering::SeqCst);
            }
            return Some(ClientEvent::Event(frame));
        }
        FrameDecode::Envelope(_) | FrameDecode::UnknownKind(_) => return None,
        FrameDecode::Malformed(_) => {}
    }
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Connected {
            session_id,
            last_seq: max_seq,
        }) => Some(ClientEvent::Connected {
            session_id,
            last_seq: max_seq,
        }),
        Ok(frame) => Some(ClientEvent::Frame(frame)),
        Err(e) => {
            debug!(error = %e, "unrecognized relay frame ignored");
            None
        }
    }
}
