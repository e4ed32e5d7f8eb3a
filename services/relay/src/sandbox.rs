//! Sandbox manager interface.
//!
//! Provisioning (containers, microVMs, remote workers) lives outside this
//! service; the hub only needs two operations: attach to a provisioned
//! sandbox, and pause one.  The built-in manager covers the two local
//! flavours — agents run directly as subprocesses, and agents reachable
//! over a socket — which is enough to run the relay end to end.

use crate::environment::EnvConfig;
use crate::transport::{
    AgentLaunchSpec, ReconnectConfig, SocketTransport, SubprocessTransport, Transport,
};
use async_trait::async_trait;
use relay_protocol::ClientInfo;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Provider type for local subprocess agents.
pub const PROVIDER_PROCESS: &str = "process";
/// Provider type for agents behind a socket.
pub const PROVIDER_SOCKET: &str = "socket";

#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("provider failure: {0}")]
    Provider(String),
}

impl SandboxError {
    /// Errors the reaper tolerates: the sandbox is already gone.
    pub fn is_gone(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }
}

/// External collaborator that owns sandbox lifecycles.
#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Attach to a provisioned sandbox, yielding a connected channel.
    async fn attach_session(
        &self,
        provider_type: &str,
        provider_id: &str,
        env: Option<EnvConfig>,
    ) -> Result<Arc<Transport>, SandboxError>;

    /// Suspend a sandbox to release resources.
    async fn pause(&self, provider_type: &str, provider_id: &str) -> Result<(), SandboxError>;
}

/// Configuration for the built-in local manager.
#[derive(Debug, Clone)]
pub struct LocalSandboxConfig {
    /// Agent binary for `process` sandboxes.
    pub agent_program: String,
    /// Arguments placed before the transport's own flags.
    pub agent_args: Vec<String>,
    /// Root under which per-sandbox agent state directories are created.
    pub state_root: PathBuf,
    /// Reconnect policy for `socket` sandboxes.
    pub reconnect: ReconnectConfig,
}

/// Built-in manager for local subprocess and socket sandboxes.
///
/// `process` sandboxes use the provider id as the project root the agent
/// works in; `socket` sandboxes use it as the WebSocket URL.
pub struct LocalSandboxManager {
    config: LocalSandboxConfig,
}

impl LocalSandboxManager {
    pub fn new(config: LocalSandboxConfig) -> Self {
        LocalSandboxManager { config }
    }

    fn agent_dir_for(&self, provider_id: &str) -> PathBuf {
        // Provider ids are paths or URLs; flatten to a single directory name.
        let flattened: String = provider_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.config.state_root.join(flattened)
    }
}

#[async_trait]
impl SandboxManager for LocalSandboxManager {
    async fn attach_session(
        &self,
        provider_type: &str,
        provider_id: &str,
        env: Option<EnvConfig>,
    ) -> Result<Arc<Transport>, SandboxError> {
        let transport = match provider_type {
            PROVIDER_PROCESS => Transport::Subprocess(SubprocessTransport::new(AgentLaunchSpec {
                program: self.config.agent_program.clone(),
                args: self.config.agent_args.clone(),
                project_root: PathBuf::from(provider_id),
                agent_dir: self.agent_dir_for(provider_id),
            })),
            PROVIDER_SOCKET => Transport::Socket(SocketTransport::new(
                provider_id.to_owned(),
                ClientInfo {
                    name: "relay".to_owned(),
                    version: env!("CARGO_PKG_VERSION").to_owned(),
                },
                self.config.reconnect.clone(),
            )),
            other => {
                return Err(SandboxError::Provider(format!(
                    "unknown provider type '{other}'"
                )));
            }
        };

        if let Some(env) = &env {
            debug!(env_id = %env.id, provider_type, "attaching with environment config");
        }
        transport
            .connect()
            .await
            .map_err(|e| SandboxError::AttachFailed(e.to_string()))?;
        Ok(Arc::new(transport))
    }

    async fn pause(&self, provider_type: &str, provider_id: &str) -> Result<(), SandboxError> {
        match provider_type {
            // Local flavours have nothing to suspend beyond the channel the
            // hub already released; the call exists for provider parity.
            PROVIDER_PROCESS | PROVIDER_SOCKET => {
                debug!(provider_type, provider_id, "pause is a no-op for local sandboxes");
                Ok(())
            }
            other => Err(SandboxError::NotFound(format!(
                "unknown provider type '{other}'"
            ))),
        }
    }
}
