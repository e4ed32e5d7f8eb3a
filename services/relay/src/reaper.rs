//! Idle reaper: pauses sandboxes of quiet, clientless sessions.
//!
//! Each tick scans `active` sessions against their environment's idle
//! timeout.  A session idles only when its last activity is older than the
//! timeout *and* no clients are connected; environments whose provider
//! manages idling itself never appear in the timeout map.  One session
//! failing never aborts the tick.

use crate::environment::EnvironmentService;
use crate::hub_manager::HubManager;
use crate::sandbox::SandboxManager;
use crate::store::{SessionStatus, SharedStore};
use chrono::Utc;
use relay_protocol::{SandboxStatus, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Message broadcast to a session's (empty) hub when it idles.
pub const IDLE_MESSAGE: &str = "Session idled due to inactivity";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub check_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            check_interval: Duration::from_secs(45),
        }
    }
}

pub struct IdleReaper {
    store: SharedStore,
    manager: Arc<HubManager>,
    sandbox: Arc<dyn SandboxManager>,
    environments: Arc<dyn EnvironmentService>,
    config: ReaperConfig,
}

/// Handle returned by [`IdleReaper::start`]; dropping it does not stop the
/// reaper, `stop()` does.  A tick already in progress runs to completion.
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

impl IdleReaper {
    pub fn new(
        store: SharedStore,
        manager: Arc<HubManager>,
        sandbox: Arc<dyn SandboxManager>,
        environments: Arc<dyn EnvironmentService>,
        config: ReaperConfig,
    ) -> Arc<Self> {
        Arc::new(IdleReaper {
            store,
            manager,
            sandbox,
            environments,
            config,
        })
    }

    pub fn start(self: &Arc<Self>) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reaper = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.config.check_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        reaper.tick().await;
                    }
                }
            }
            debug!("reaper stopped");
        });
        ReaperHandle { shutdown_tx, task }
    }

    /// One scan over the active sessions.
    pub async fn tick(&self) {
        let timeouts = self.environments.idle_timeouts().await;
        let sessions = {
            let store = self.store.lock().await;
            match store.sessions_with_status(SessionStatus::Active) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!(error = %e, "reaper could not list active sessions");
                    return;
                }
            }
        };

        let now = Utc::now();
        for session in sessions {
            // Pure chat sessions and self-idling providers are left alone.
            let Some(env_id) = &session.environment_id else {
                continue;
            };
            let Some(timeout_secs) = timeouts.get(env_id) else {
                continue;
            };
            let idle_ms = (now - session.last_activity_at).num_milliseconds();
            if idle_ms < (*timeout_secs as i64) * 1000 {
                continue;
            }
            if self.manager.connection_count(&session.id).await > 0 {
                continue;
            }
            if let Err(e) = self.idle_session(&session).await {
                warn!(session_id = %session.id, error = %e, "failed to idle session");
            }
        }
    }

    async fn idle_session(&self, session: &crate::store::Session) -> Result<(), String> {
        // Race guard: a client may have connected since the scan.
        if self.manager.connection_count(&session.id).await > 0 {
            debug!(session_id = %session.id, "client connected during idle; skipping");
            return Ok(());
        }

        // Usually lands in an empty hub; kept for observability parity.
        self.manager
            .broadcast(
                &session.id,
                ServerFrame::SandboxStatus {
                    status: SandboxStatus::Paused,
                    message: Some(IDLE_MESSAGE.to_owned()),
                },
            )
            .await;
        self.manager.clear_session_client_state(&session.id).await;

        if let (Some(provider), Some(provider_id)) =
            (&session.sandbox_provider, &session.sandbox_provider_id)
        {
            match self.sandbox.pause(provider, provider_id).await {
                Ok(()) => {}
                Err(e) if e.is_gone() => {
                    warn!(session_id = %session.id, error = %e, "sandbox already gone; idling anyway");
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        let swapped = {
            let store = self.store.lock().await;
            store
                .cas_status(&session.id, SessionStatus::Active, SessionStatus::Idle)
                .map_err(|e| e.to_string())?
        };
        if swapped {
            info!(session_id = %session.id, "session idled");
        } else {
            // An activation raced us; leave the session alone.
            debug!(session_id = %session.id, "session no longer active; idle skipped");
        }
        Ok(())
    }
}
