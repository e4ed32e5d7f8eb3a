//! Relay configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/pi-relay/relay.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else carries a default; `[[environments]]` entries need at
//! least an `id` and an `idle_timeout_secs`.

use crate::environment::EnvEntry;
use crate::transport::ReconnectConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub hub: HubConfig,
    pub reaper: ReaperSection,
    pub sandbox: SandboxSection,
    pub journal: JournalSection,
    pub environments: HashMap<String, EnvEntry>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub detach_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct ReaperSection {
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxSection {
    pub agent_program: String,
    pub agent_args: Vec<String>,
    pub state_root: PathBuf,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone)]
pub struct JournalSection {
    /// Archived sessions' events older than this are pruned.
    pub prune_max_age: Duration,
    pub prune_interval: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (all-optional mirror)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServer>,
    store: Option<RawStore>,
    hub: Option<RawHub>,
    reaper: Option<RawReaper>,
    sandbox: Option<RawSandbox>,
    journal: Option<RawJournal>,
    environments: Option<Vec<RawEnvironment>>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStore {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHub {
    detach_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawReaper {
    check_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSandbox {
    agent_program: Option<String>,
    agent_args: Option<Vec<String>>,
    state_root: Option<String>,
    reconnect: Option<RawReconnect>,
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    max_attempts: Option<u32>,
    base_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawJournal {
    prune_max_age_days: Option<u64>,
    prune_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEnvironment {
    id: Option<String>,
    idle_timeout_secs: Option<u64>,
    self_idling: Option<bool>,
    settings: Option<toml::Value>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/pi-relay/relay.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let server = ServerConfig {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "127.0.0.1:8787".to_owned()),
    };

    let store = StoreConfig {
        sqlite_path: raw
            .store
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/pi-relay/relay.sqlite3".to_owned()),
    };

    let hub = HubConfig {
        detach_grace: Duration::from_millis(
            raw.hub
                .and_then(|h| h.detach_grace_ms)
                .unwrap_or(crate::hub::DETACH_GRACE_MS),
        ),
    };

    let reaper = ReaperSection {
        check_interval: Duration::from_secs(
            raw.reaper.and_then(|r| r.check_interval_secs).unwrap_or(45),
        ),
    };

    let raw_sandbox = raw.sandbox;
    let raw_reconnect = raw_sandbox.as_ref().and_then(|s| s.reconnect.as_ref());
    let defaults = ReconnectConfig::default();
    let sandbox = SandboxSection {
        agent_program: raw_sandbox
            .as_ref()
            .and_then(|s| s.agent_program.clone())
            .unwrap_or_else(|| "pi".to_owned()),
        agent_args: raw_sandbox
            .as_ref()
            .and_then(|s| s.agent_args.clone())
            .unwrap_or_default(),
        state_root: PathBuf::from(
            raw_sandbox
                .as_ref()
                .and_then(|s| s.state_root.clone())
                .unwrap_or_else(|| "/var/lib/pi-relay/agents".to_owned()),
        ),
        reconnect: ReconnectConfig {
            max_attempts: raw_reconnect
                .and_then(|r| r.max_attempts)
                .unwrap_or(defaults.max_attempts),
            base: raw_reconnect
                .and_then(|r| r.base_ms)
                .map_or(defaults.base, Duration::from_millis),
            max_delay: raw_reconnect
                .and_then(|r| r.max_delay_ms)
                .map_or(defaults.max_delay, Duration::from_millis),
        },
    };

    let journal = JournalSection {
        prune_max_age: Duration::from_secs(
            raw.journal
                .as_ref()
                .and_then(|j| j.prune_max_age_days)
                .unwrap_or(30)
                * 24
                * 3600,
        ),
        prune_interval: Duration::from_secs(
            raw.journal
                .as_ref()
                .and_then(|j| j.prune_interval_secs)
                .unwrap_or(3600),
        ),
    };

    let mut environments = HashMap::new();
    for (i, env) in raw.environments.unwrap_or_default().into_iter().enumerate() {
        let id = env
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("environments[{}].id", i)))?;
        let idle_timeout_secs = env.idle_timeout_secs.ok_or_else(|| {
            ConfigError::MissingField(format!("environments[{}].idle_timeout_secs", i))
        })?;
        let settings = match env.settings {
            Some(value) => toml_to_json(value),
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        environments.insert(
            id,
            EnvEntry {
                idle_timeout_secs,
                self_idling: env.self_idling.unwrap_or(false),
                settings,
            },
        );
    }

    Ok(RelayConfig {
        schema_version,
        server,
        store,
        hub,
        reaper,
        sandbox,
        journal,
        environments,
    })
}

fn toml_to_json(value: toml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
