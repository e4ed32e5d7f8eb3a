// mock_agent: a scripted socket agent for testing the relay's transport.
//
// Speaks the v1 envelope protocol: answers `hello` (with resume support),
// acks every other request, and emits events on demand.  Connections can
// be killed abruptly to exercise the reconnect controller.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{
    Envelope, EventFrame, FrameDecode, HelloRequest, HelloResponse, PROTOCOL_VERSION,
    RequestFrame, ResponseFrame, ResumeInfo, ServerCapabilities, methods,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock socket agent for integration testing.
///
/// # Protocol behavior
///
/// - `hello` requests are answered with a `HelloResponse`.  While resume
///   acceptance is on (the default), the connection id is stable across
///   connections, so a reconnecting transport sees its prior id echoed and
///   missed events (by the presented `lastSeqBySession`) are replayed from
///   the emit history.  With acceptance off, every hello gets a fresh id.
/// - Any other request is acked with `ok: true` and a null result.
/// - Events pushed via [`MockAgentServer::emit_event`] go to every live
///   connection and into the replay history.
pub struct MockAgentServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: tokio::task::JoinHandle<()>,
}

struct MockState {
    connection_id: String,
    accept_resume: AtomicBool,
    requests: Mutex<Vec<RequestFrame>>,
    resumes: Mutex<Vec<Option<ResumeInfo>>>,
    history: Mutex<Vec<EventFrame>>,
    events_tx: broadcast::Sender<EventFrame>,
    kill_tx: broadcast::Sender<()>,
    connections: AtomicUsize,
}

impl MockAgentServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (events_tx, _) = broadcast::channel(256);
        let (kill_tx, _) = broadcast::channel(16);
        let state = Arc::new(MockState {
            connection_id: uuid::Uuid::new_v4().to_string(),
            accept_resume: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            resumes: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            events_tx,
            kill_tx,
            connections: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task: task,
        })
    }

    /// Stop accepting and drop every connection; subsequent dials are
    /// refused.  Used to exhaust a transport's reconnect budget.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let _ = self.state.kill_tx.send(());
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Emit one event to every live connection and the replay history.
    pub fn emit_event(
        &self,
        session_id: &str,
        seq: Option<u64>,
        event_type: &str,
        payload: Option<serde_json::Value>,
    ) {
        let frame = EventFrame {
            v: PROTOCOL_VERSION,
            session_id: session_id.to_owned(),
            seq,
            event_type: event_type.to_owned(),
            payload,
        };
        self.state.history.lock().unwrap().push(frame.clone());
        let _ = self.state.events_tx.send(frame);
    }

    /// Drop every live connection without a close frame.
    pub fn kill_connections(&self) {
        let _ = self.state.kill_tx.send(());
    }

    /// When off, every hello gets a fresh connection id (resume rejected).
    pub fn set_accept_resume(&self, accept: bool) {
        self.state.accept_resume.store(accept, Ordering::SeqCst);
    }

    /// All requests received so far (hello included).
    pub fn requests(&self) -> Vec<RequestFrame> {
        self.state.requests.lock().unwrap().clone()
    }

    /// The resume info presented by each hello, in order.
    pub fn resumes(&self) -> Vec<Option<ResumeInfo>> {
        self.state.resumes.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<MockState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let mut events_rx = state.events_tx.subscribe();
    let mut kill_rx = state.kill_tx.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                _ = kill_rx.recv() => {
                    // Abrupt drop: no close frame.
                    return Ok(());
                }
                event = events_rx.recv() => {
                    if let Ok(frame) = event {
                        let text = serde_json::to_string(&Envelope::Event(frame))?;
                        write.send(Message::Text(text.into())).await?;
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        None => return Ok(()),
                        Some(msg) => msg?,
                    };
                    let text = match msg {
                        Message::Text(t) => t,
                        Message::Close(_) => return Ok(()),
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                            continue;
                        }
                        _ => continue,
                    };
                    if let FrameDecode::Envelope(Envelope::Request(request)) =
                        Envelope::decode(&text)
                    {
                        state.requests.lock().unwrap().push(request.clone());
                        let (response, replay) = if request.method == methods::HELLO {
                            handle_hello(&state, &request)?
                        } else {
                            (
                                ResponseFrame {
                                    v: PROTOCOL_VERSION,
                                    id: request.id.clone(),
                                    session_id: request.session_id.clone(),
                                    ok: true,
                                    result: Some(serde_json::Value::Null),
                                    error: None,
                                },
                                Vec::new(),
                            )
                        };
                        let text = serde_json::to_string(&Envelope::Response(response))?;
                        write.send(Message::Text(text.into())).await?;
                        // Missed tail replays after the hello response,
                        // before any live events.
                        for frame in replay {
                            let text = serde_json::to_string(&Envelope::Event(frame))?;
                            write.send(Message::Text(text.into())).await?;
                        }
                    }
                }
            }
        }
    }
    .await;

    state.connections.fetch_sub(1, Ordering::SeqCst);
    result
}

/// Answer a hello; on accepted resume, also return the missed tail to
/// replay right after the response.
fn handle_hello(
    state: &Arc<MockState>,
    request: &RequestFrame,
) -> Result<(ResponseFrame, Vec<EventFrame>), Box<dyn std::error::Error + Send + Sync>> {
    let hello: Option<HelloRequest> = request
        .params
        .clone()
        .and_then(|p| serde_json::from_value(p).ok());
    let resume = hello.and_then(|h| h.resume);
    state.resumes.lock().unwrap().push(resume.clone());

    let accept = state.accept_resume.load(Ordering::SeqCst);
    let connection_id = if accept {
        state.connection_id.clone()
    } else {
        uuid::Uuid::new_v4().to_string()
    };

    let response = ResponseFrame {
        v: PROTOCOL_VERSION,
        id: request.id.clone(),
        session_id: None,
        ok: true,
        result: Some(serde_json::to_value(HelloResponse {
            connection_id: connection_id.clone(),
            capabilities: ServerCapabilities {
                resume: true,
                replay_window_secs: 3600,
            },
        })?),
        error: None,
    };

    let mut replay = Vec::new();
    if accept {
        if let Some(resume) = resume {
            if resume.connection_id == state.connection_id {
                let history = state.history.lock().unwrap().clone();
                for frame in history {
                    let cursor = resume
                        .last_seq_by_session
                        .get(&frame.session_id)
                        .copied()
                        .unwrap_or(0);
                    if frame.seq.is_some_and(|s| s > cursor) {
                        replay.push(frame);
                    }
                }
            }
        }
    }

    Ok((response, replay))
}
