//! Duplex channels to agent processes.
//!
//! Two variants behind one contract: a local subprocess speaking
//! newline-framed JSON over stdio, and a remote agent behind a socket
//! speaking one versioned envelope per frame.  The hub sees the same
//! surface either way: request/response with correlation, fire-and-forget
//! sends, and a single-consumer event stream.
//!
//! # Event buffering
//! Events fan out through a broadcast channel of capacity
//! [`EVENT_BUFFER_CAPACITY`].  A consumer that falls behind loses the
//! oldest buffered events (newest wins) instead of back-pressuring the
//! reader task, so a noisy agent can never be stalled by a paused hub.

pub mod socket;
pub mod subprocess;

pub use socket::{ReconnectConfig, SocketTransport};
pub use subprocess::{AgentLaunchSpec, SubprocessTransport};

use relay_protocol::{ErrorBody, RpcEvent};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Capacity of the per-transport event buffer (newest-wins on overflow).
pub const EVENT_BUFFER_CAPACITY: usize = 100;

/// Attempts to match a response that arrived before its waiter registered.
pub const RESPONSE_MATCH_RETRIES: u32 = 5;

/// Spacing between response-match attempts.
pub const RESPONSE_MATCH_DELAY: Duration = Duration::from_millis(10);

/// Default deadline for the transport's own requests (hello, attach).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("encoding failed: {0}")]
    EncodingFailed(String),
    #[error("decoding failed: {0}")]
    DecodingFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("server error: {message}")]
    ServerError {
        code: Option<String>,
        message: String,
        details: Option<String>,
    },
    #[error("no models available")]
    NoModelsAvailable,
}

impl TransportError {
    pub(crate) fn from_error_body(body: ErrorBody) -> Self {
        TransportError::ServerError {
            code: body.code,
            message: body.message,
            details: body.details,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One decoded agent event as surfaced to the hub.
///
/// `raw_payload` is the payload exactly as emitted (journaled verbatim);
/// `payload` is its parsed form for routing and the static server hooks.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub session_id: Option<String>,
    pub seq: Option<u64>,
    pub event: RpcEvent,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
    pub raw_payload: String,
}

impl TransportEvent {
    pub(crate) fn new(
        session_id: Option<String>,
        seq: Option<u64>,
        event_type: String,
        payload: Option<serde_json::Value>,
    ) -> Self {
        let event = RpcEvent::decode(&event_type, payload.as_ref());
        let raw_payload = payload
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "null".to_owned());
        TransportEvent {
            session_id,
            seq,
            event,
            event_type,
            payload,
            raw_payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses and pending waiters
// ---------------------------------------------------------------------------

/// A response normalized across both wire flavours.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub ok: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    /// Decode the declared shape out of a successful response.
    pub fn into_result<R: DeserializeOwned>(self) -> Result<R, TransportError> {
        if !self.ok {
            let body = self.error.unwrap_or(ErrorBody {
                code: None,
                message: "unspecified server error".to_owned(),
                details: None,
            });
            return Err(TransportError::from_error_body(body));
        }
        serde_json::from_value(self.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

struct PendingRequest {
    method: String,
    submitted_at: Instant,
    reply: oneshot::Sender<Result<RpcResponse, TransportError>>,
}

/// Waiters for in-flight requests, keyed by request id (envelope) or by
/// command name (legacy subprocess flavour).
#[derive(Default)]
pub(crate) struct Pending {
    waiters: Mutex<HashMap<String, PendingRequest>>,
}

impl Pending {
    pub(crate) fn register(
        &self,
        key: &str,
        method: &str,
    ) -> oneshot::Receiver<Result<RpcResponse, TransportError>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("pending lock");
        if waiters.contains_key(key) {
            debug!(key, method, "replacing stale pending request");
        }
        waiters.insert(
            key.to_owned(),
            PendingRequest {
                method: method.to_owned(),
                submitted_at: Instant::now(),
                reply: tx,
            },
        );
        rx
    }

    pub(crate) fn remove(&self, key: &str) {
        self.waiters.lock().expect("pending lock").remove(key);
    }

    fn complete(&self, key: &str, response: RpcResponse) -> bool {
        let entry = self.waiters.lock().expect("pending lock").remove(key);
        match entry {
            Some(pending) => {
                debug!(
                    key,
                    method = %pending.method,
                    elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
                    "response matched"
                );
                let _ = pending.reply.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Match a response to its waiter, retrying briefly to tolerate a
    /// response that raced ahead of the waiter registration.  Returns false
    /// when no waiter ever appears; the caller logs and drops.
    pub(crate) async fn complete_with_retry(&self, key: &str, response: RpcResponse) -> bool {
        for attempt in 0..=RESPONSE_MATCH_RETRIES {
            if self.complete(key, response.clone()) {
                return true;
            }
            if attempt < RESPONSE_MATCH_RETRIES {
                tokio::time::sleep(RESPONSE_MATCH_DELAY).await;
            }
        }
        warn!(key, "response matched no pending request after retries; dropping");
        false
    }

    /// Fail every in-flight waiter (connection lost / shutdown).
    pub(crate) fn fail_all(&self, error: &TransportError) {
        let drained: Vec<PendingRequest> = {
            let mut waiters = self.waiters.lock().expect("pending lock");
            waiters.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiters.lock().expect("pending lock").len()
    }
}

// ---------------------------------------------------------------------------
// Legacy JSONL decoding (shared by both variants)
// ---------------------------------------------------------------------------

/// A decoded legacy-flavour frame: one JSON object with a `type` field.
///
/// Legacy `response` objects double as events — they resolve a waiter keyed
/// by their `command` *and* still travel the event stream, since `response`
/// is part of the event taxonomy and the server hooks read it.
pub(crate) struct LegacyFrame {
    /// `(command, response)` when the frame is a correlatable response.
    pub response: Option<(String, RpcResponse)>,
    pub event: TransportEvent,
}

/// Decode a legacy line/frame.  Returns `None` for non-objects or objects
/// without a `type`; callers log and drop those.
pub(crate) fn decode_legacy_frame(text: &str) -> Option<LegacyFrame> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let event_type = value.get("type")?.as_str()?.to_owned();

    let response = if event_type == "response" {
        value
            .get("command")
            .and_then(|c| c.as_str())
            .map(|command| (command.to_owned(), legacy_response(&value)))
    } else {
        None
    };

    let session_id = value
        .get("sessionId")
        .and_then(|s| s.as_str())
        .map(ToOwned::to_owned);
    let seq = value.get("seq").and_then(|s| s.as_u64());
    let event = TransportEvent::new(session_id, seq, event_type, Some(value));
    Some(LegacyFrame { response, event })
}

fn legacy_response(value: &serde_json::Value) -> RpcResponse {
    let error = value
        .get("error")
        .cloned()
        .and_then(|e| serde_json::from_value::<ErrorBody>(e).ok());
    let ok = value
        .get("ok")
        .and_then(|o| o.as_bool())
        .unwrap_or(error.is_none());
    RpcResponse {
        ok,
        result: value.get("result").cloned().or_else(|| Some(value.clone())),
        error,
    }
}

/// Await a registered waiter with an optional deadline.
pub(crate) async fn await_response(
    pending: &Pending,
    key: &str,
    rx: oneshot::Receiver<Result<RpcResponse, TransportError>>,
    deadline: Option<Duration>,
) -> Result<RpcResponse, TransportError> {
    let deadline = deadline.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        // Sender dropped without a reply: the waiter was cancelled.
        Ok(Err(_)) => Err(TransportError::Cancelled),
        Err(_) => {
            pending.remove(key);
            Err(TransportError::Timeout)
        }
    }
}

// ---------------------------------------------------------------------------
// Transport facade
// ---------------------------------------------------------------------------

/// The uniform channel the hub holds, hiding subprocess vs socket.
pub enum Transport {
    Subprocess(SubprocessTransport),
    Socket(SocketTransport),
}

impl Transport {
    /// Idempotent connect.
    pub async fn connect(&self) -> Result<(), TransportError> {
        match self {
            Transport::Subprocess(t) => t.connect().await,
            Transport::Socket(t) => t.connect().await,
        }
    }

    /// Cancel in-flight waiters, close the channel, finalize the stream.
    pub async fn disconnect(&self) {
        match self {
            Transport::Subprocess(t) => t.disconnect().await,
            Transport::Socket(t) => t.disconnect().await,
        }
    }

    /// Send a request and decode the declared response shape.
    pub async fn send<R: DeserializeOwned>(
        &self,
        method: &str,
        session_id: Option<&str>,
        params: Option<serde_json::Value>,
        deadline: Option<Duration>,
    ) -> Result<R, TransportError> {
        let response = match self {
            Transport::Subprocess(t) => t.send_raw(method, session_id, params, deadline).await?,
            Transport::Socket(t) => t.send_raw(method, session_id, params, deadline).await?,
        };
        response.into_result()
    }

    /// Send a request, await acknowledgement, discard the payload.
    pub async fn send_void(
        &self,
        method: &str,
        session_id: Option<&str>,
        params: Option<serde_json::Value>,
        deadline: Option<Duration>,
    ) -> Result<(), TransportError> {
        let response = match self {
            Transport::Subprocess(t) => t.send_raw(method, session_id, params, deadline).await?,
            Transport::Socket(t) => t.send_raw(method, session_id, params, deadline).await?,
        };
        if !response.ok {
            let body = response.error.unwrap_or(ErrorBody {
                code: None,
                message: "unspecified server error".to_owned(),
                details: None,
            });
            return Err(TransportError::from_error_body(body));
        }
        Ok(())
    }

    /// Forward a client command in its original encoding.
    ///
    /// The write is awaited (failures surface to the sending client); the
    /// agent's acknowledgement is observed in the background so forwarded
    /// commands are not serialized behind agent round-trips.
    pub async fn forward_command(
        &self,
        command: &relay_protocol::ClientCommand,
        raw: &str,
        session_id: &str,
    ) -> Result<(), TransportError> {
        match self {
            Transport::Subprocess(t) => t.forward_command(command, raw, session_id).await,
            Transport::Socket(t) => t.forward_command(command, raw, session_id).await,
        }
    }

    /// Subscribe to the event stream.  Intended for a single consumer (the
    /// hub); a slow consumer loses the oldest buffered events.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        match self {
            Transport::Subprocess(t) => t.events(),
            Transport::Socket(t) => t.events(),
        }
    }

    /// Observe channel closure; yields the close reason.
    pub fn closed(&self) -> tokio::sync::watch::Receiver<Option<String>> {
        match self {
            Transport::Subprocess(t) => t.closed(),
            Transport::Socket(t) => t.closed(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self {
            Transport::Subprocess(t) => t.is_connected().await,
            Transport::Socket(t) => t.is_connected().await,
        }
    }

    pub async fn connection_id(&self) -> Option<String> {
        match self {
            Transport::Subprocess(t) => t.connection_id().await,
            Transport::Socket(t) => t.connection_id().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response() -> RpcResponse {
        RpcResponse {
            ok: true,
            result: Some(serde_json::json!({"value": 7})),
            error: None,
        }
    }

    #[tokio::test]
    async fn pending_completes_registered_waiter() {
        let pending = Pending::default();
        let rx = pending.register("req-1", "session.get_state");
        assert!(pending.complete_with_retry("req-1", ok_response()).await);
        let response = rx.await.unwrap().unwrap();
        assert!(response.ok);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn pending_retries_cover_registration_race() {
        let pending = std::sync::Arc::new(Pending::default());
        let matcher = {
            let pending = std::sync::Arc::clone(&pending);
            tokio::spawn(async move { pending.complete_with_retry("late", ok_response()).await })
        };
        // Register after the matcher has already started.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rx = pending.register("late", "get_state");
        assert!(matcher.await.unwrap(), "retry window should cover the race");
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn pending_gives_up_after_bounded_retries() {
        let pending = Pending::default();
        let start = Instant::now();
        assert!(!pending.complete_with_retry("ghost", ok_response()).await);
        // Five retries at 10ms spacing.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_waiter() {
        let pending = Pending::default();
        let rx1 = pending.register("a", "m1");
        let rx2 = pending.register("b", "m2");
        pending.fail_all(&TransportError::ConnectionLost("shutdown".to_owned()));
        assert!(matches!(
            rx1.await.unwrap(),
            Err(TransportError::ConnectionLost(_))
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(TransportError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn await_response_times_out_and_clears_waiter() {
        let pending = Pending::default();
        let rx = pending.register("slow", "get_messages");
        let result =
            await_response(&pending, "slow", rx, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(pending.len(), 0, "timed-out waiter must be removed");
    }

    #[test]
    fn rpc_response_decodes_declared_shape() {
        #[derive(serde::Deserialize)]
        struct Shape {
            value: u32,
        }
        let shape: Shape = ok_response().into_result().unwrap();
        assert_eq!(shape.value, 7);

        let failed = RpcResponse {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: Some("NOPE".to_owned()),
                message: "rejected".to_owned(),
                details: None,
            }),
        };
        assert!(matches!(
            failed.into_result::<Shape>(),
            Err(TransportError::ServerError { .. })
        ));
    }

    #[test]
    fn transport_event_precomputes_raw_payload() {
        let ev = TransportEvent::new(
            Some("s1".to_owned()),
            Some(3),
            "extension_ui_request".to_owned(),
            Some(serde_json::json!({"method": "setTitle", "title": "Refactor"})),
        );
        assert!(matches!(ev.event, RpcEvent::ExtensionUiRequest { .. }));
        assert!(ev.raw_payload.contains("setTitle"));

        let bare = TransportEvent::new(None, None, "agent_end".to_owned(), None);
        assert_eq!(bare.raw_payload, "null");
    }
}
