// relay-protocol: wire types for the agent relay.
//
// The socket protocol is versioned: every frame is one JSON object with a
// `v` field (currently 1) and a `kind` discriminant.  Agent events and
// relay-emitted frames use a `type` discriminant instead; unknown types are
// always preserved rather than rejected so forwarding stays lossless.

use serde::{Deserialize, Serialize};

/// Protocol version carried in every envelope frame.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Envelope frames (socket transport, v1)
// ---------------------------------------------------------------------------

/// A request frame, correlated to exactly one response by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub v: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A response frame.  `ok == false` implies `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub v: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// An event frame.  `seq` is the journal sequence assigned by the relay;
/// agent-side frames may omit it (the relay assigns on append).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub v: u32,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Error body carried in failed responses and relay error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The three frame kinds of the v1 envelope protocol.
///
/// ```json
/// { "v":1, "kind":"request", "id":"...", "method":"...", "params":{} }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
}

/// Outcome of decoding one inbound frame.
///
/// Unknown kinds are distinguished from malformed JSON so callers can
/// ignore the former silently and log the latter.
#[derive(Debug)]
pub enum FrameDecode {
    Envelope(Envelope),
    /// Well-formed JSON object with an unrecognized `kind` value.
    UnknownKind(String),
    /// Not an envelope at all (bad JSON, or no `kind` field).  Carries the
    /// decode error for logging; callers may hand the text to a legacy
    /// decoder as a fallback.
    Malformed(String),
}

impl Envelope {
    /// Decode one frame of text into an envelope, classifying failures.
    pub fn decode(text: &str) -> FrameDecode {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return FrameDecode::Malformed(e.to_string()),
        };
        let kind = match value.get("kind").and_then(|k| k.as_str()) {
            Some(k) => k.to_owned(),
            None => return FrameDecode::Malformed("missing `kind` field".to_owned()),
        };
        match serde_json::from_value::<Envelope>(value) {
            Ok(env) => FrameDecode::Envelope(env),
            Err(e) => {
                if matches!(kind.as_str(), "request" | "response" | "event") {
                    FrameDecode::Malformed(e.to_string())
                } else {
                    FrameDecode::UnknownKind(kind)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agent event taxonomy
// ---------------------------------------------------------------------------

/// Decoded agent event discriminant.
///
/// The relay never interprets event payloads beyond what routing and the
/// static server hooks need; variants carry only those fields.  The full
/// payload travels separately (journaled and forwarded verbatim).  Unknown
/// types are explicit so they journal and forward like any other event.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    MessageStart,
    MessageUpdate {
        /// Decoded sub-event when `payload.event` parses; `None` otherwise.
        event: Option<AssistantMessageEvent>,
    },
    MessageEnd,
    ToolExecutionStart,
    ToolExecutionUpdate,
    ToolExecutionEnd,
    AutoCompactionStart,
    AutoCompactionEnd,
    AutoRetryStart,
    AutoRetryEnd,
    ExtensionError,
    ExtensionUiRequest {
        method: ExtensionUiMethod,
    },
    StateUpdate,
    ModelChanged,
    NativeToolRequest,
    NativeToolCancel,
    Response {
        /// Legacy correlation key: the command this response answers.
        command: Option<String>,
    },
    Unknown {
        event_type: String,
    },
}

impl RpcEvent {
    /// Build the tagged variant from an event's `type` string and payload.
    ///
    /// Never fails: unrecognized types become [`RpcEvent::Unknown`], and a
    /// payload that does not match the expected shape degrades to the bare
    /// variant (routing still works; the payload is forwarded untouched).
    pub fn decode(event_type: &str, payload: Option<&serde_json::Value>) -> RpcEvent {
        match event_type {
            "agent_start" => RpcEvent::AgentStart,
            "agent_end" => RpcEvent::AgentEnd,
            "turn_start" => RpcEvent::TurnStart,
            "turn_end" => RpcEvent::TurnEnd,
            "message_start" => RpcEvent::MessageStart,
            "message_update" => RpcEvent::MessageUpdate {
                event: payload
                    .and_then(|p| p.get("event"))
                    .and_then(|e| serde_json::from_value(e.clone()).ok()),
            },
            "message_end" => RpcEvent::MessageEnd,
            "tool_execution_start" => RpcEvent::ToolExecutionStart,
            "tool_execution_update" => RpcEvent::ToolExecutionUpdate,
            "tool_execution_end" => RpcEvent::ToolExecutionEnd,
            "auto_compaction_start" => RpcEvent::AutoCompactionStart,
            "auto_compaction_end" => RpcEvent::AutoCompactionEnd,
            "auto_retry_start" => RpcEvent::AutoRetryStart,
            "auto_retry_end" => RpcEvent::AutoRetryEnd,
            "extension_error" => RpcEvent::ExtensionError,
            "extension_ui_request" => RpcEvent::ExtensionUiRequest {
                method: payload
                    .and_then(|p| p.get("method"))
                    .and_then(|m| m.as_str())
                    .map(ExtensionUiMethod::from_wire)
                    .unwrap_or(ExtensionUiMethod::Unknown),
            },
            "state_update" => RpcEvent::StateUpdate,
            "model_changed" => RpcEvent::ModelChanged,
            "native_tool_request" => RpcEvent::NativeToolRequest,
            "native_tool_cancel" => RpcEvent::NativeToolCancel,
            "response" => RpcEvent::Response {
                command: payload
                    .and_then(|p| p.get("command"))
                    .and_then(|c| c.as_str())
                    .map(ToOwned::to_owned),
            },
            other => RpcEvent::Unknown {
                event_type: other.to_owned(),
            },
        }
    }
}

/// Interactive dialog methods an agent can request of the controller client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionUiMethod {
    SetTitle,
    Confirm,
    Input,
    Select,
    Unknown,
}

impl ExtensionUiMethod {
    pub fn from_wire(method: &str) -> Self {
        match method {
            "setTitle" => ExtensionUiMethod::SetTitle,
            "confirm" => ExtensionUiMethod::Confirm,
            "input" => ExtensionUiMethod::Input,
            "select" => ExtensionUiMethod::Select,
            _ => ExtensionUiMethod::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Assistant-message sub-events
// ---------------------------------------------------------------------------

/// Sub-events carried inside `message_update.payload.event`.
///
/// Legacy agents emit older names (`toolcall_start`, `start`, `done`, ...);
/// serde aliases fold them onto the canonical variants so downstream code
/// only ever sees one spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    #[serde(alias = "text_start", alias = "text_end")]
    TextDelta {
        #[serde(default)]
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    #[serde(alias = "toolcall_start")]
    ToolUseStart {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(alias = "toolcall_delta")]
    ToolUseInputDelta {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(alias = "toolcall_end")]
    ToolUseEnd {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(alias = "start")]
    MessageStart,
    #[serde(alias = "done")]
    MessageEnd,
    ContentBlockStart {
        #[serde(default)]
        index: u32,
    },
    ContentBlockEnd {
        #[serde(default)]
        index: u32,
    },
}

// ---------------------------------------------------------------------------
// Client commands
// ---------------------------------------------------------------------------

/// Commands a front-end client sends to the relay for its session.
///
/// The relay classifies commands for routing and journaling but forwards the
/// original encoded text to the agent, so variants only name the fields the
/// relay itself reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientCommand {
    Prompt {
        message: String,
    },
    Steer {
        message: String,
    },
    FollowUp {
        message: String,
    },
    Abort,
    GetState,
    GetMessages,
    GetAvailableModels,
    SetModel {
        model: String,
    },
    NewSession,
    SwitchSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ExtensionUiResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Unrecognized command kind, preserved verbatim so forwarding stays
    /// lossless.  Never serialized; produced only by [`ClientCommand::decode`].
    #[serde(skip)]
    Unknown { command_type: String, raw: String },
}

impl ClientCommand {
    /// Decode a command, preserving unrecognized kinds as
    /// [`ClientCommand::Unknown`] with the raw text.
    ///
    /// Fails on non-JSON input, on objects without a string `type`, and on
    /// a *known* `type` whose body does not match its declared shape.
    pub fn decode(raw: &str) -> Result<ClientCommand, serde_json::Error> {
        match serde_json::from_str::<ClientCommand>(raw) {
            Ok(command) => Ok(command),
            Err(e) => {
                let value: serde_json::Value = serde_json::from_str(raw)?;
                match value.get("type").and_then(|t| t.as_str()) {
                    Some(kind) if !Self::is_known_type(kind) => Ok(ClientCommand::Unknown {
                        command_type: kind.to_owned(),
                        raw: raw.to_owned(),
                    }),
                    _ => Err(e),
                }
            }
        }
    }

    fn is_known_type(kind: &str) -> bool {
        matches!(
            kind,
            "prompt"
                | "steer"
                | "follow_up"
                | "abort"
                | "get_state"
                | "get_messages"
                | "get_available_models"
                | "set_model"
                | "new_session"
                | "switch_session"
                | "extension_ui_response"
        )
    }

    /// True for commands that make the sender the session's last writer.
    pub fn is_writer_command(&self) -> bool {
        matches!(
            self,
            ClientCommand::Prompt { .. }
                | ClientCommand::Steer { .. }
                | ClientCommand::FollowUp { .. }
        )
    }

    /// The envelope method name used when forwarding this command as a
    /// request to a socket-flavour agent.  Unknown kinds forward under
    /// their original type string.
    pub fn method(&self) -> &str {
        match self {
            ClientCommand::Prompt { .. } => methods::SESSION_PROMPT,
            ClientCommand::Steer { .. } => methods::SESSION_STEER,
            ClientCommand::FollowUp { .. } => methods::SESSION_FOLLOW_UP,
            ClientCommand::Abort => methods::SESSION_ABORT,
            ClientCommand::GetState => methods::SESSION_GET_STATE,
            ClientCommand::GetMessages => methods::SESSION_GET_MESSAGES,
            ClientCommand::GetAvailableModels => methods::SESSION_GET_AVAILABLE_MODELS,
            ClientCommand::SetModel { .. } => methods::SESSION_SET_MODEL,
            ClientCommand::NewSession => methods::SESSION_NEW_SESSION,
            ClientCommand::SwitchSession { .. } => methods::SESSION_SWITCH_SESSION,
            ClientCommand::ExtensionUiResponse { .. } => methods::EXTENSION_UI_RESPONSE,
            ClientCommand::Unknown { command_type, .. } => command_type,
        }
    }
}

/// Method names accepted at the hub edge (and used toward socket agents).
pub mod methods {
    pub const HELLO: &str = "hello";
    pub const SESSION_ATTACH: &str = "session.attach";
    pub const SESSION_PROMPT: &str = "session.prompt";
    pub const SESSION_STEER: &str = "session.steer";
    pub const SESSION_FOLLOW_UP: &str = "session.follow_up";
    pub const SESSION_ABORT: &str = "session.abort";
    pub const SESSION_GET_STATE: &str = "session.get_state";
    pub const SESSION_GET_MESSAGES: &str = "session.get_messages";
    pub const SESSION_GET_AVAILABLE_MODELS: &str = "session.get_available_models";
    pub const SESSION_SET_MODEL: &str = "session.set_model";
    pub const SESSION_NEW_SESSION: &str = "session.new_session";
    pub const SESSION_SWITCH_SESSION: &str = "session.switch_session";
    pub const EXTENSION_UI_RESPONSE: &str = "extension_ui_response";
}

// ---------------------------------------------------------------------------
// Relay-emitted server frames
// ---------------------------------------------------------------------------

/// Sandbox lifecycle states surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Running,
    Paused,
    Stopped,
}

/// Frames the relay itself emits to clients (as opposed to forwarded agent
/// events, which travel as [`EventFrame`] envelopes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String, last_seq: u64 },
    #[serde(rename_all = "camelCase")]
    ReplayStart { from_seq: u64, to_seq: u64 },
    ReplayEnd,
    SandboxStatus {
        status: SandboxStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error { code: String, message: String },
}

// ---------------------------------------------------------------------------
// Hello handshake (socket transport)
// ---------------------------------------------------------------------------

/// `hello` request params: who is connecting and what it remembers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub client_info: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeInfo>,
}

/// Identity of the connecting peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Resume state remembered across connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfo {
    pub connection_id: String,
    #[serde(default)]
    pub last_seq_by_session: std::collections::HashMap<String, u64>,
}

/// `hello` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    pub connection_id: String,
    pub capabilities: ServerCapabilities,
}

/// What the server side of a socket connection supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    pub resume: bool,
    pub replay_window_secs: u64,
}

// ---------------------------------------------------------------------------
// Frozen codes
// ---------------------------------------------------------------------------

/// Error envelope used by all non-2xx HTTP API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// WebSocket close codes used at the client edge.
pub mod close_codes {
    /// Client connected without a `clientId`.
    pub const MISSING_CLIENT_ID: u16 = 4001;
    /// Session not active, sandbox not provisioned, or attach failed.
    pub const SESSION_NOT_ACTIVE: u16 = 4003;
    /// Session does not exist or is archived.
    pub const SESSION_NOT_FOUND: u16 = 4004;
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Error codes carried in relay `error` frames.
pub mod error_codes {
    pub const UNKNOWN_CLIENT: &str = "UNKNOWN_CLIENT";
    pub const NOT_CONTROLLER: &str = "NOT_CONTROLLER";
    pub const CHANNEL_DETACHED: &str = "CHANNEL_DETACHED";
    pub const SLOW_CONSUMER: &str = "SLOW_CONSUMER";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_round_trips_with_camel_case_fields() {
        let frame = Envelope::Request(RequestFrame {
            v: PROTOCOL_VERSION,
            id: "req-1".to_owned(),
            session_id: Some("s1".to_owned()),
            method: methods::SESSION_PROMPT.to_owned(),
            params: Some(json!({"message": "hi"})),
        });
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"kind\":\"request\""));
        assert!(text.contains("\"sessionId\":\"s1\""));

        match Envelope::decode(&text) {
            FrameDecode::Envelope(decoded) => assert_eq!(decoded, frame),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn event_frame_uses_type_and_optional_seq() {
        let text = r#"{"v":1,"kind":"event","sessionId":"s1","seq":7,"type":"agent_start"}"#;
        match Envelope::decode(text) {
            FrameDecode::Envelope(Envelope::Event(ev)) => {
                assert_eq!(ev.seq, Some(7));
                assert_eq!(ev.event_type, "agent_start");
                assert_eq!(ev.payload, None);
            }
            other => panic!("expected event, got {other:?}"),
        }

        let no_seq = r#"{"v":1,"kind":"event","sessionId":"s1","type":"turn_end"}"#;
        match Envelope::decode(no_seq) {
            FrameDecode::Envelope(Envelope::Event(ev)) => assert_eq!(ev.seq, None),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_distinguished_from_malformed() {
        match Envelope::decode(r#"{"v":1,"kind":"telemetry","blob":true}"#) {
            FrameDecode::UnknownKind(kind) => assert_eq!(kind, "telemetry"),
            other => panic!("expected unknown kind, got {other:?}"),
        }
        assert!(matches!(
            Envelope::decode("{not json"),
            FrameDecode::Malformed(_)
        ));
        assert!(matches!(
            Envelope::decode(r#"{"v":1,"id":"x"}"#),
            FrameDecode::Malformed(_)
        ));
        // Right kind but wrong shape is malformed, not unknown.
        assert!(matches!(
            Envelope::decode(r#"{"v":1,"kind":"request"}"#),
            FrameDecode::Malformed(_)
        ));
    }

    #[test]
    fn rpc_event_decodes_the_full_taxonomy() {
        let known = [
            "agent_start",
            "agent_end",
            "turn_start",
            "turn_end",
            "message_start",
            "message_update",
            "message_end",
            "tool_execution_start",
            "tool_execution_update",
            "tool_execution_end",
            "auto_compaction_start",
            "auto_compaction_end",
            "auto_retry_start",
            "auto_retry_end",
            "extension_error",
            "extension_ui_request",
            "state_update",
            "model_changed",
            "native_tool_request",
            "native_tool_cancel",
            "response",
        ];
        for event_type in known {
            let decoded = RpcEvent::decode(event_type, None);
            assert!(
                !matches!(decoded, RpcEvent::Unknown { .. }),
                "{event_type} should be a known variant"
            );
        }
    }

    #[test]
    fn rpc_event_preserves_unknown_types() {
        match RpcEvent::decode("hologram_update", Some(&json!({"x": 1}))) {
            RpcEvent::Unknown { event_type } => assert_eq!(event_type, "hologram_update"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn rpc_event_extracts_routing_fields() {
        let ui = RpcEvent::decode(
            "extension_ui_request",
            Some(&json!({"method": "setTitle", "title": "Fix the build"})),
        );
        assert_eq!(
            ui,
            RpcEvent::ExtensionUiRequest {
                method: ExtensionUiMethod::SetTitle
            }
        );

        let resp = RpcEvent::decode("response", Some(&json!({"command": "get_state"})));
        assert_eq!(
            resp,
            RpcEvent::Response {
                command: Some("get_state".to_owned())
            }
        );
    }

    #[test]
    fn assistant_message_event_accepts_legacy_aliases() {
        let cases = [
            (json!({"type": "toolcall_start", "id": "t1", "name": "bash"}),
             "tool_use_start"),
            (json!({"type": "toolcall_delta", "id": "t1", "delta": "ls"}),
             "tool_use_input_delta"),
            (json!({"type": "toolcall_end", "id": "t1"}), "tool_use_end"),
            (json!({"type": "start"}), "message_start"),
            (json!({"type": "done"}), "message_end"),
        ];
        for (legacy, canonical) in cases {
            let decoded: AssistantMessageEvent =
                serde_json::from_value(legacy.clone()).unwrap_or_else(|e| {
                    panic!("legacy alias {legacy} should decode: {e}");
                });
            let reencoded = serde_json::to_value(&decoded).unwrap();
            assert_eq!(
                reencoded.get("type").and_then(|t| t.as_str()),
                Some(canonical),
                "legacy {legacy} should re-encode as the canonical name"
            );
        }
    }

    #[test]
    fn assistant_message_event_text_aliases_fold_to_delta() {
        for legacy in ["text_start", "text_end"] {
            let decoded: AssistantMessageEvent =
                serde_json::from_value(json!({"type": legacy})).unwrap();
            assert_eq!(
                decoded,
                AssistantMessageEvent::TextDelta {
                    text: String::new()
                }
            );
        }
    }

    #[test]
    fn client_command_classifies_writers_and_maps_methods() {
        let prompt: ClientCommand =
            serde_json::from_value(json!({"type": "prompt", "message": "hello"})).unwrap();
        assert!(prompt.is_writer_command());
        assert_eq!(prompt.method(), "session.prompt");

        let abort: ClientCommand = serde_json::from_value(json!({"type": "abort"})).unwrap();
        assert!(!abort.is_writer_command());
        assert_eq!(abort.method(), "session.abort");

        let ui: ClientCommand = serde_json::from_value(
            json!({"type": "extension_ui_response", "id": "u1", "result": {"ok": true}}),
        )
        .unwrap();
        assert!(!ui.is_writer_command());
        assert_eq!(ui.method(), "extension_ui_response");
    }

    #[test]
    fn client_command_decode_preserves_unknown_kinds() {
        let raw = r#"{"type":"set_thinking_level","level":"high"}"#;
        match ClientCommand::decode(raw).unwrap() {
            ClientCommand::Unknown { command_type, raw: carried } => {
                assert_eq!(command_type, "set_thinking_level");
                assert_eq!(carried, raw);
            }
            other => panic!("expected unknown carry, got {other:?}"),
        }
        let unknown = ClientCommand::decode(raw).unwrap();
        assert!(!unknown.is_writer_command());
        assert_eq!(unknown.method(), "set_thinking_level");
    }

    #[test]
    fn client_command_decode_still_rejects_malformed_input() {
        assert!(ClientCommand::decode("{not json").is_err());
        assert!(ClientCommand::decode(r#"{"message":"no type"}"#).is_err());
        // A known kind with the wrong shape is an error, not an unknown.
        assert!(ClientCommand::decode(r#"{"type":"prompt"}"#).is_err());
        assert!(matches!(
            ClientCommand::decode(r#"{"type":"prompt","message":"hi"}"#),
            Ok(ClientCommand::Prompt { .. })
        ));
    }

    #[test]
    fn server_frames_serialize_to_the_frozen_shapes() {
        let connected = ServerFrame::Connected {
            session_id: "s1".to_owned(),
            last_seq: 42,
        };
        assert_eq!(
            serde_json::to_value(&connected).unwrap(),
            json!({"type": "connected", "sessionId": "s1", "lastSeq": 42})
        );

        let replay = ServerFrame::ReplayStart {
            from_seq: 1,
            to_seq: 3,
        };
        assert_eq!(
            serde_json::to_value(&replay).unwrap(),
            json!({"type": "replay_start", "fromSeq": 1, "toSeq": 3})
        );

        let status = ServerFrame::SandboxStatus {
            status: SandboxStatus::Paused,
            message: Some("Session idled due to inactivity".to_owned()),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value.get("status").unwrap(), "paused");
    }

    #[test]
    fn hello_round_trips_resume_info() {
        let hello = HelloRequest {
            client_info: ClientInfo {
                name: "relay".to_owned(),
                version: "0.1.0".to_owned(),
            },
            resume: Some(ResumeInfo {
                connection_id: "conn-1".to_owned(),
                last_seq_by_session: [("s5".to_owned(), 42u64)].into_iter().collect(),
            }),
        };
        let text = serde_json::to_string(&hello).unwrap();
        assert!(text.contains("\"lastSeqBySession\""));
        let back: HelloRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, hello);
    }
}
