//! Environment service interface.
//!
//! Environments describe where a session's sandbox runs and how quickly it
//! may be idled.  The full catalogue lives outside this service; the relay
//! reads two things: per-environment idle timeouts (for the reaper) and the
//! opaque config blob handed to the sandbox manager at attach time.

use async_trait::async_trait;
use std::collections::HashMap;

/// Opaque environment configuration passed through to the sandbox manager.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub id: String,
    pub settings: serde_json::Value,
}

/// External collaborator exposing environment metadata.
#[async_trait]
pub trait EnvironmentService: Send + Sync {
    /// Idle timeout per environment id, in seconds.
    ///
    /// Environments whose provider manages idling itself (remote workers
    /// with built-in sleep) are excluded — the reaper must leave them alone.
    async fn idle_timeouts(&self) -> HashMap<String, u64>;

    /// Resolve the config for one environment; `None` when unknown.
    async fn env_config(&self, env_id: &str) -> Option<EnvConfig>;
}

/// One configured environment.
#[derive(Debug, Clone)]
pub struct EnvEntry {
    pub idle_timeout_secs: u64,
    /// True when the provider idles sandboxes on its own.
    pub self_idling: bool,
    pub settings: serde_json::Value,
}

/// Environment service backed by the relay's own config file.
pub struct StaticEnvironmentService {
    entries: HashMap<String, EnvEntry>,
}

impl StaticEnvironmentService {
    pub fn new(entries: HashMap<String, EnvEntry>) -> Self {
        StaticEnvironmentService { entries }
    }
}

#[async_trait]
impl EnvironmentService for StaticEnvironmentService {
    async fn idle_timeouts(&self) -> HashMap<String, u64> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.self_idling)
            .map(|(id, entry)| (id.clone(), entry.idle_timeout_secs))
            .collect()
    }

    async fn env_config(&self, env_id: &str) -> Option<EnvConfig> {
        self.entries.get(env_id).map(|entry| EnvConfig {
            id: env_id.to_owned(),
            settings: entry.settings.clone(),
        })
    }
}
