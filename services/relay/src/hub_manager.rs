//! Registry of session hubs.
//!
//! Hubs are created lazily when the first client arrives and disposed a
//! little after the detach grace expires with no clients, so a quick
//! reconnect reuses both the hub and (within the grace) its live channel.

use crate::hub::{ClientCapabilities, Hub, HubContext, HubOptions};
use relay_protocol::ServerFrame;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Extra slack past the detach grace before the in-memory hub is disposed.
pub const DISPOSE_SLACK_MS: u64 = 1000;

pub struct HubManager {
    ctx: HubContext,
    options: HubOptions,
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
}

impl HubManager {
    pub fn new(ctx: HubContext, options: HubOptions) -> Arc<Self> {
        Arc::new(HubManager {
            ctx,
            options,
            hubs: RwLock::new(HashMap::new()),
        })
    }

    /// Existing hub for a session, if any.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Hub>> {
        self.hubs.read().await.get(session_id).cloned()
    }

    /// Lazily create the hub for a session.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Hub> {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(session_id) {
                return Arc::clone(hub);
            }
        }
        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(session_id) {
            return Arc::clone(hub);
        }
        debug!(session_id, "creating hub");
        let hub = Hub::new(
            session_id.to_owned(),
            self.ctx.clone(),
            self.options.clone(),
        );
        hubs.insert(session_id.to_owned(), Arc::clone(&hub));
        hub
    }

    /// Schedule disposal of the hub once the detach grace (plus slack) has
    /// passed; fires only if no client reconnected in the meantime.
    pub fn schedule_remove_if_empty(self: &Arc<Self>, session_id: &str) {
        let manager = Arc::clone(self);
        let session_id = session_id.to_owned();
        let delay = self.options.detach_grace + Duration::from_millis(DISPOSE_SLACK_MS);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.remove_if_empty(&session_id).await;
        });
    }

    /// Close and drop the hub if it has no clients.
    pub async fn remove_if_empty(&self, session_id: &str) {
        let hub = {
            let hubs = self.hubs.read().await;
            hubs.get(session_id).cloned()
        };
        let Some(hub) = hub else { return };
        if hub.connection_count().await > 0 {
            return;
        }
        hub.close().await;
        self.hubs.write().await.remove(session_id);
        debug!(session_id, "hub disposed");
    }

    pub async fn set_client_capabilities(
        &self,
        session_id: &str,
        client_id: &str,
        capabilities: ClientCapabilities,
    ) {
        if let Some(hub) = self.get(session_id).await {
            hub.set_client_capabilities(client_id, capabilities).await;
        }
    }

    pub async fn set_activator_client(&self, session_id: &str, client_id: &str) {
        if let Some(hub) = self.get(session_id).await {
            hub.set_activator_client(client_id).await;
        }
    }

    pub async fn clear_session_client_state(&self, session_id: &str) {
        if let Some(hub) = self.get(session_id).await {
            hub.clear_client_state().await;
        }
    }

    /// Broadcast a relay frame to a session's clients.  Restricted to
    /// `sandbox_status`; nothing else is relay-originated.
    pub async fn broadcast(&self, session_id: &str, frame: ServerFrame) {
        if !matches!(frame, ServerFrame::SandboxStatus { .. }) {
            warn!(session_id, "refusing to broadcast non-status frame");
            return;
        }
        if let Some(hub) = self.get(session_id).await {
            hub.broadcast_server_frame(frame).await;
        }
    }

    pub async fn connection_count(&self, session_id: &str) -> usize {
        match self.get(session_id).await {
            Some(hub) => hub.connection_count().await,
            None => 0,
        }
    }

    /// Shutdown: close every hub and clear the registry.
    pub async fn close_all(&self) {
        let hubs: Vec<Arc<Hub>> = {
            let mut map = self.hubs.write().await;
            map.drain().map(|(_, hub)| hub).collect()
        };
        for hub in hubs {
            hub.close().await;
        }
    }
}
