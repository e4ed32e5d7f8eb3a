//! Local subprocess transport.
//!
//! Spawns the agent binary in RPC mode and speaks newline-framed JSON over
//! stdio.  Stdout carries events and legacy responses; stderr is kept in a
//! small diagnostics ring for startup classification.
//!
//! # Legacy correlation
//! This flavour predates per-request ids: responses carry a `command` field
//! matching the request's `type`.  A response that lands before its waiter
//! registers is retried briefly (see [`super::Pending::complete_with_retry`]).
//! Legacy `response` objects are *also* surfaced on the event stream, since
//! `response` is part of the event taxonomy and the server hooks read it.
//!
//! # Line hygiene
//! Agents occasionally interleave terminal noise with protocol output.
//! Before parsing, ANSI CSI and OSC sequences are stripped and the line is
//! anchored at its first `{`; anything left that is not JSON is dropped
//! with a debug trace.

use super::{
    EVENT_BUFFER_CAPACITY, Pending, RpcResponse, TransportError, TransportEvent, await_response,
    decode_legacy_frame,
};
use regex::Regex;
use relay_protocol::{ClientCommand, Envelope, FrameDecode};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long to let the process settle before declaring the launch healthy.
const SETTLE_WINDOW: Duration = Duration::from_millis(200);

/// Lines of stderr retained for startup diagnostics.
const DIAGNOSTIC_RING_CAPACITY: usize = 64;

/// How the agent subprocess is launched.
#[derive(Debug, Clone)]
pub struct AgentLaunchSpec {
    /// Agent binary (or interpreter) to execute.
    pub program: String,
    /// Arguments placed before the `--mode rpc` flag.
    pub args: Vec<String>,
    /// Working directory: the project root the agent operates on.
    pub project_root: PathBuf,
    /// Per-session state directory, exported as `PI_CODING_AGENT_DIR`.
    pub agent_dir: PathBuf,
}

struct ProcState {
    child: Child,
    stdin: ChildStdin,
    connection_id: String,
    reader: tokio::task::JoinHandle<()>,
    stderr_reader: tokio::task::JoinHandle<()>,
}

struct Inner {
    spec: AgentLaunchSpec,
    state: Mutex<Option<ProcState>>,
    pending: Pending,
    events_tx: broadcast::Sender<TransportEvent>,
    closed_tx: watch::Sender<Option<String>>,
    diagnostics: Arc<StdMutex<VecDeque<String>>>,
}

/// Transport over a locally spawned agent process.
#[derive(Clone)]
pub struct SubprocessTransport {
    inner: Arc<Inner>,
}

impl SubprocessTransport {
    pub fn new(spec: AgentLaunchSpec) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_CAPACITY);
        let (closed_tx, _) = watch::channel(None);
        SubprocessTransport {
            inner: Arc::new(Inner {
                spec,
                state: Mutex::new(None),
                pending: Pending::default(),
                events_tx,
                closed_tx,
                diagnostics: Arc::new(StdMutex::new(VecDeque::new())),
            }),
        }
    }

    /// Spawn the agent and verify it survives the settle window.
    ///
    /// Idempotent: a second call while connected is a no-op.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        self.inner
            .diagnostics
            .lock()
            .expect("diagnostics lock")
            .clear();

        let spec = &self.inner.spec;
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .arg("--mode")
            .arg("rpc")
            .current_dir(&spec.project_root)
            .env("PI_CODING_AGENT_DIR", &spec.agent_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::ConnectionFailed(format!("spawn: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("no stdin pipe".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("no stdout pipe".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("no stderr pipe".to_owned()))?;

        // Diagnostics reader must be running before the settle check so
        // early startup errors are captured.
        let diagnostics = Arc::clone(&self.inner.diagnostics);
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "relay::agent_stderr", "{line}");
                let mut ring = diagnostics.lock().expect("diagnostics lock");
                if ring.len() == DIAGNOSTIC_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });

        tokio::time::sleep(SETTLE_WINDOW).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                stderr_reader.abort();
                return Err(self.classify_startup_exit(status));
            }
            Ok(None) => {}
            Err(e) => {
                stderr_reader.abort();
                return Err(TransportError::ConnectionFailed(format!(
                    "settle check: {e}"
                )));
            }
        }

        let connection_id = Uuid::new_v4().to_string();
        let reader = tokio::spawn(reader_loop(Arc::clone(&self.inner), stdout));
        info!(
            program = %spec.program,
            connection_id = %connection_id,
            "agent subprocess attached"
        );

        *state = Some(ProcState {
            child,
            stdin,
            connection_id,
            reader,
            stderr_reader,
        });
        Ok(())
    }

    fn classify_startup_exit(&self, status: std::process::ExitStatus) -> TransportError {
        let ring = self.inner.diagnostics.lock().expect("diagnostics lock");
        if ring.iter().any(|line| no_models_pattern().is_match(line)) {
            return TransportError::NoModelsAvailable;
        }
        let tail: Vec<&str> = ring.iter().rev().take(3).map(String::as_str).collect();
        TransportError::ConnectionFailed(format!(
            "agent exited during startup ({status}): {}",
            tail.join(" | ")
        ))
    }

    /// Kill the agent, failing all in-flight waiters.
    pub async fn disconnect(&self) {
        let taken = self.inner.state.lock().await.take();
        self.inner
            .pending
            .fail_all(&TransportError::ConnectionLost("shutdown".to_owned()));
        if let Some(mut state) = taken {
            state.reader.abort();
            state.stderr_reader.abort();
            if let Err(e) = state.child.start_kill() {
                debug!(error = %e, "agent kill failed (already exited?)");
            }
            let _ = state.child.wait().await;
        }
        let _ = self.inner.closed_tx.send(Some("shutdown".to_owned()));
    }

    /// Send a legacy request (`type` = command name) and await the matched
    /// response.
    pub async fn send_raw(
        &self,
        method: &str,
        session_id: Option<&str>,
        params: Option<serde_json::Value>,
        deadline: Option<Duration>,
    ) -> Result<RpcResponse, TransportError> {
        let command = legacy_command_name(method);
        let line = encode_legacy_request(command, session_id, params)?;
        let rx = self.inner.pending.register(command, method);
        if let Err(e) = self.write_line(&line).await {
            self.inner.pending.remove(command);
            return Err(e);
        }
        await_response(&self.inner.pending, command, rx, deadline).await
    }

    /// Forward a client command verbatim as one line.
    ///
    /// The acknowledgement (a legacy response keyed by the command name) is
    /// awaited in the background; only write failures surface to the caller.
    pub async fn forward_command(
        &self,
        command: &ClientCommand,
        raw: &str,
        _session_id: &str,
    ) -> Result<(), TransportError> {
        let key = legacy_command_name(command.method()).to_owned();
        let rx = self.inner.pending.register(&key, command.method());
        if let Err(e) = self.write_line(raw.trim()).await {
            self.inner.pending.remove(&key);
            return Err(e);
        }
        tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move {
                match await_response(&inner.pending, &key, rx, None).await {
                    Ok(_) => {}
                    Err(e) => debug!(command = %key, error = %e, "forwarded command ack"),
                }
            }
        });
        Ok(())
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().await;
        let state = state.as_mut().ok_or(TransportError::NotConnected)?;
        let mut framed = line.as_bytes().to_vec();
        framed.push(b'\n');
        state
            .stdin
            .write_all(&framed)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        state
            .stdin
            .flush()
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
        self.inner.state.lock().await.is_some()
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .as_ref()
            .map(|s| s.connection_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

async fn reader_loop(inner: Arc<Inner>, stdout: tokio::process::ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(cleaned) = clean_line(&line) else {
                    debug!(dropped = %truncate_for_log(&line), "non-JSON agent output dropped");
                    continue;
                };
                handle_frame(&inner, &cleaned);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "agent stdout read error");
                break;
            }
        }
    }

    // EOF: the process went away underneath us.
    inner
        .pending
        .fail_all(&TransportError::ConnectionLost("process exited".to_owned()));
    let _ = inner.closed_tx.send(Some("process exited".to_owned()));
    if let Some(mut state) = inner.state.lock().await.take() {
        state.stderr_reader.abort();
        let _ = state.child.wait().await;
    }
}

fn handle_frame(inner: &Arc<Inner>, cleaned: &str) {
    match Envelope::decode(cleaned) {
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
        // Not an envelope: this is the legacy JSONL flavour.
        FrameDecode::Malformed(_) => handle_legacy_line(inner, cleaned),
    }
}

fn handle_legacy_line(inner: &Arc<Inner>, cleaned: &str) {
    let Some(frame) = decode_legacy_frame(cleaned) else {
        debug!(dropped = %truncate_for_log(cleaned), "unparseable agent line dropped");
        return;
    };
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

// ---------------------------------------------------------------------------
// Line hygiene
// ---------------------------------------------------------------------------

fn csi_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("CSI pattern"))
}

fn osc_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("OSC pattern"))
}

fn no_models_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)no models available").expect("no-models pattern"))
}

/// Strip terminal noise and anchor at the first `{`.
///
/// Returns `None` when nothing JSON-shaped remains; callers drop the line.
fn clean_line(line: &str) -> Option<String> {
    // Fast path: most lines are pure JSON.
    if line.starts_with('{') {
        return Some(line.to_owned());
    }
    let stripped = osc_pattern().replace_all(line, "");
    let stripped = csi_pattern().replace_all(&stripped, "");
    let start = stripped.find('{')?;
    Some(stripped[start..].to_owned())
}

fn legacy_command_name(method: &str) -> &str {
    method.strip_prefix("session.").unwrap_or(method)
}

fn encode_legacy_request(
    command: &str,
    session_id: Option<&str>,
    params: Option<serde_json::Value>,
) -> Result<String, TransportError> {
    let mut object = match params {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("params".to_owned(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    object.insert(
        "type".to_owned(),
        serde_json::Value::String(command.to_owned()),
    );
    if let Some(sid) = session_id {
        object.insert(
            "sessionId".to_owned(),
            serde_json::Value::String(sid.to_owned()),
        );
    }
    serde_json::to_string(&serde_json::Value::Object(object))
        .map_err(|e| TransportError::EncodingFailed(e.to_string()))
}

fn truncate_for_log(line: &str) -> &str {
    let end = line
        .char_indices()
        .nth(120)
        .map_or(line.len(), |(idx, _)| idx);
    &line[..end]
}
