//! Client-facing WebSocket edge.
//!
//! One socket per (client, session).  The URL names the session; query
//! params carry the client's identity, capabilities and resume cursor:
//!
//! ```text
//! GET /ws/v1/sessions/{session_id}?clientId=...&lastSeq=42&extensionUi=true
//! ```
//!
//! Inbound text frames are client commands; outbound frames are either
//! relay frames (`connected`, `replay_*`, `sandbox_status`, `error`) or
//! journaled agent events as envelope event frames.  Command rejections go
//! only to the offending socket.

use crate::hub::{
    CLIENT_OUTBOUND_CAPACITY, ClientCapabilities, CloseCommand, NewClient, OutboundFrame,
};
use crate::hub_manager::HubManager;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use relay_protocol::{
    Envelope, ErrorBody, EventFrame, FrameDecode, HelloResponse, PROTOCOL_VERSION, RequestFrame,
    ResponseFrame, ServerCapabilities, ServerFrame, close_codes, methods,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct WsState {
    pub manager: Arc<HubManager>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub last_seq: Option<u64>,
    #[serde(default)]
    pub extension_ui: Option<bool>,
    /// Set by the client that triggered session activation; used as a
    /// controller-election hint.
    #[serde(default)]
    pub activator: Option<bool>,
}

pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, session_id, params))
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}

async fn handle_session_socket(
    mut socket: WebSocket,
    state: WsState,
    session_id: String,
    params: WsParams,
) {
    let Some(client_id) = params.client_id.filter(|id| !id.is_empty()) else {
        close_with(&mut socket, close_codes::MISSING_CLIENT_ID, "clientId is required").await;
        return;
    };
    let last_seq = params.last_seq.unwrap_or(0);
    let capabilities = ClientCapabilities {
        extension_ui: params.extension_ui.unwrap_or(false),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(CLIENT_OUTBOUND_CAPACITY);
    let (kill_tx, mut kill_rx) = oneshot::channel::<CloseCommand>();

    let hub = state.manager.get_or_create(&session_id).await;
    let admitted = hub
        .add_client(
            NewClient {
                client_id: client_id.clone(),
                capabilities,
                outbound_tx,
                kill_tx,
            },
            last_seq,
        )
        .await;

    if let Err(e) = admitted {
        warn!(session_id = %session_id, client_id = %client_id, error = %e, "client rejected");
        close_with(&mut socket, e.close_code(), &e.to_string()).await;
        state.manager.schedule_remove_if_empty(&session_id);
        return;
    }
    if params.activator.unwrap_or(false) {
        hub.set_activator_client(&client_id).await;
    }
    info!(session_id = %session_id, client_id = %client_id, last_seq, "client connected");

    loop {
        tokio::select! {
            // The hub decided to terminate this client (slow consumer,
            // hub close): flush the final error frame, then close.
            cmd = &mut kill_rx => {
                if let Ok(cmd) = cmd {
                    if let Some(frame) = cmd.frame {
                        let _ = send_frame(&mut socket, OutboundFrame::Server(frame)).await;
                    }
                    close_with(&mut socket, cmd.code, &cmd.reason).await;
                } else {
                    close_with(&mut socket, close_codes::NORMAL, "closed").await;
                }
                break;
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut socket, frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_inbound_text(&mut socket, &hub, &client_id, &text)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    hub.remove_client(&client_id).await;
    state.manager.schedule_remove_if_empty(&session_id);
    info!(session_id = %session_id, client_id = %client_id, "client disconnected");
}

/// Dispatch one inbound text frame.
///
/// The edge is bilingual: a frame is either a versioned request envelope
/// (`hello`, `session.attach`, `session.prompt`, ...) answered with a
/// response envelope, or a bare command object answered (on rejection
/// only) with an error frame.  Rejections go to this socket alone.
async fn handle_inbound_text(
    socket: &mut WebSocket,
    hub: &Arc<crate::hub::Hub>,
    client_id: &str,
    text: &str,
) -> Result<(), axum::Error> {
    match Envelope::decode(text) {
        FrameDecode::Envelope(Envelope::Request(request)) => {
            let response = handle_edge_request(hub, client_id, &request).await;
            let text = match serde_json::to_string(&Envelope::Response(response)) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "response encode failed");
                    return Ok(());
                }
            };
            socket.send(Message::Text(text.into())).await
        }
        FrameDecode::Envelope(_) | FrameDecode::UnknownKind(_) => {
            debug!(client_id, "ignoring non-request envelope from client");
            Ok(())
        }
        FrameDecode::Malformed(_) => {
            // The legacy flavour: a bare command object.
            if let Err(e) = hub.handle_client_command(client_id, text).await {
                debug!(client_id, error = %e, "command rejected");
                let reject = OutboundFrame::Server(ServerFrame::Error {
                    code: e.code().to_owned(),
                    message: e.to_string(),
                });
                return send_frame(socket, reject).await;
            }
            Ok(())
        }
    }
}

/// Answer one request envelope at the hub edge.
async fn handle_edge_request(
    hub: &Arc<crate::hub::Hub>,
    client_id: &str,
    request: &RequestFrame,
) -> ResponseFrame {
    let ok = ResponseFrame {
        v: PROTOCOL_VERSION,
        id: request.id.clone(),
        session_id: request.session_id.clone(),
        ok: true,
        result: None,
        error: None,
    };
    match request.method.as_str() {
        // Identity and attach are established by the socket itself; these
        // methods exist so envelope-speaking clients get an answer.
        methods::HELLO => ResponseFrame {
            result: serde_json::to_value(HelloResponse {
                connection_id: client_id.to_owned(),
                capabilities: ServerCapabilities {
                    resume: true,
                    replay_window_secs: u64::MAX,
                },
            })
            .ok(),
            ..ok
        },
        methods::SESSION_ATTACH => ok,
        _ => {
            let raw = match command_raw_from_request(request) {
                Some(raw) => raw,
                None => {
                    return ResponseFrame {
                        ok: false,
                        error: Some(ErrorBody {
                            code: Some(relay_protocol::error_codes::INTERNAL_ERROR.to_owned()),
                            message: format!("unsupported method '{}'", request.method),
                            details: None,
                        }),
                        ..ok
                    };
                }
            };
            match hub.handle_client_command(client_id, &raw).await {
                Ok(()) => ok,
                Err(e) => ResponseFrame {
                    ok: false,
                    error: Some(ErrorBody {
                        code: Some(e.code().to_owned()),
                        message: e.to_string(),
                        details: None,
                    }),
                    ..ok
                },
            }
        }
    }
}

/// Rebuild the bare command encoding from a request envelope: the params
/// object with the command `type` derived from the method name.
fn command_raw_from_request(request: &RequestFrame) -> Option<String> {
    let command_type = request
        .method
        .strip_prefix("session.")
        .unwrap_or(&request.method);
    let mut object = match request.params.clone() {
        Some(serde_json::Value::Object(map)) => map,
        None => serde_json::Map::new(),
        Some(_) => return None,
    };
    object
        .entry("type".to_owned())
        .or_insert_with(|| serde_json::Value::String(command_type.to_owned()));
    serde_json::to_string(&serde_json::Value::Object(object)).ok()
}

async fn send_frame(socket: &mut WebSocket, frame: OutboundFrame) -> Result<(), axum::Error> {
    let text = match frame {
        OutboundFrame::Server(server) => serde_json::to_string(&server),
        OutboundFrame::Event(event) => serde_json::to_string(&Envelope::Event(EventFrame {
            v: PROTOCOL_VERSION,
            ..event
        })),
    };
    match text {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!(error = %e, "outbound frame encode failed");
            Ok(())
        }
    }
}
