/// Idle reaper tests: timeout selection, pause tolerance, CAS transitions.
use async_trait::async_trait;
use relay::environment::{EnvConfig, EnvEntry, StaticEnvironmentService};
use relay::hub::{HubContext, HubOptions};
use relay::hub_manager::HubManager;
use relay::journal::Journal;
use relay::reaper::{IdleReaper, ReaperConfig};
use relay::sandbox::{SandboxError, SandboxManager};
use relay::store::{NewSession, SessionMode, SessionStatus, SharedStore, Store};
use relay::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sandbox manager that records pause calls; attach is never exercised.
struct RecordingSandbox {
    pauses: Mutex<Vec<(String, String)>>,
    gone: bool,
}

impl RecordingSandbox {
    fn new(gone: bool) -> Arc<Self> {
        Arc::new(RecordingSandbox {
            pauses: Mutex::new(Vec::new()),
            gone,
        })
    }

    fn pause_count(&self) -> usize {
        self.pauses.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxManager for RecordingSandbox {
    async fn attach_session(
        &self,
        _provider_type: &str,
        _provider_id: &str,
        _env: Option<EnvConfig>,
    ) -> Result<Arc<Transport>, SandboxError> {
        Err(SandboxError::AttachFailed("not under test".to_owned()))
    }

    async fn pause(&self, provider_type: &str, provider_id: &str) -> Result<(), SandboxError> {
        self.pauses
            .lock()
            .unwrap()
            .push((provider_type.to_owned(), provider_id.to_owned()));
        if self.gone {
            Err(SandboxError::NotFound("sandbox already reclaimed".to_owned()))
        } else {
            Ok(())
        }
    }
}

fn env_entries(idle_timeout_secs: u64) -> HashMap<String, EnvEntry> {
    [
        (
            "e1".to_owned(),
            EnvEntry {
                idle_timeout_secs,
                self_idling: false,
                settings: serde_json::json!({}),
            },
        ),
        (
            "worker".to_owned(),
            EnvEntry {
                idle_timeout_secs,
                self_idling: true,
                settings: serde_json::json!({}),
            },
        ),
    ]
    .into_iter()
    .collect()
}

struct ReaperStack {
    store: SharedStore,
    reaper: Arc<IdleReaper>,
    sandbox: Arc<RecordingSandbox>,
}

async fn reaper_stack(idle_timeout_secs: u64, sandbox_gone: bool) -> ReaperStack {
    let store = Store::open_in_memory().unwrap().into_shared();
    let journal = Journal::new(Arc::clone(&store));
    let sandbox = RecordingSandbox::new(sandbox_gone);
    let environments = Arc::new(StaticEnvironmentService::new(env_entries(idle_timeout_secs)));
    let ctx = HubContext {
        store: Arc::clone(&store),
        journal,
        sandbox: sandbox.clone(),
        environments: environments.clone(),
    };
    let manager = HubManager::new(ctx, HubOptions::default());
    let reaper = IdleReaper::new(
        Arc::clone(&store),
        manager,
        sandbox.clone(),
        environments,
        ReaperConfig {
            check_interval: Duration::from_millis(100),
        },
    );
    ReaperStack {
        store,
        reaper,
        sandbox,
    }
}

async fn seed(store: &SharedStore, id: &str, env: Option<&str>) {
    let store = store.lock().await;
    store
        .create_session(&NewSession {
            id: id.to_owned(),
            mode: SessionMode::Code,
            environment_id: env.map(ToOwned::to_owned),
            repo_id: None,
            sandbox_provider: Some("docker".to_owned()),
            sandbox_provider_id: Some(format!("sbx-{id}")),
            name: None,
        })
        .unwrap();
    store.set_status(id, SessionStatus::Active).unwrap();
}

async fn status_of(store: &SharedStore, id: &str) -> SessionStatus {
    store.lock().await.get_session(id).unwrap().unwrap().status
}

#[tokio::test]
async fn quiet_clientless_session_is_idled() {
    let stack = reaper_stack(1, false).await;
    seed(&stack.store, "s3", Some("e1")).await;

    // Not yet past the timeout: untouched.
    stack.reaper.tick().await;
    assert_eq!(status_of(&stack.store, "s3").await, SessionStatus::Active);
    assert_eq!(stack.sandbox.pause_count(), 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    stack.reaper.tick().await;
    assert_eq!(status_of(&stack.store, "s3").await, SessionStatus::Idle);
    assert_eq!(stack.sandbox.pause_count(), 1);

    // Already idle: later ticks leave it alone.
    stack.reaper.tick().await;
    assert_eq!(stack.sandbox.pause_count(), 1);
}

#[tokio::test]
async fn sessions_without_an_environment_are_skipped() {
    let stack = reaper_stack(1, false).await;
    seed(&stack.store, "chat", None).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    stack.reaper.tick().await;
    assert_eq!(status_of(&stack.store, "chat").await, SessionStatus::Active);
    assert_eq!(stack.sandbox.pause_count(), 0);
}

#[tokio::test]
async fn self_idling_environments_are_skipped() {
    let stack = reaper_stack(1, false).await;
    seed(&stack.store, "remote", Some("worker")).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    stack.reaper.tick().await;
    assert_eq!(status_of(&stack.store, "remote").await, SessionStatus::Active);
    assert_eq!(stack.sandbox.pause_count(), 0);
}

#[tokio::test]
async fn vanished_sandbox_is_tolerated() {
    let stack = reaper_stack(1, true).await;
    seed(&stack.store, "s3", Some("e1")).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    stack.reaper.tick().await;
    // Pause failed with not-found, yet the session still idles.
    assert_eq!(stack.sandbox.pause_count(), 1);
    assert_eq!(status_of(&stack.store, "s3").await, SessionStatus::Idle);
}

#[tokio::test]
async fn one_failing_session_does_not_abort_the_tick() {
    let stack = reaper_stack(1, true).await;
    seed(&stack.store, "a", Some("e1")).await;
    seed(&stack.store, "b", Some("e1")).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    stack.reaper.tick().await;
    assert_eq!(status_of(&stack.store, "a").await, SessionStatus::Idle);
    assert_eq!(status_of(&stack.store, "b").await, SessionStatus::Idle);
}

#[tokio::test]
async fn start_and_stop_round_trip() {
    let stack = reaper_stack(1, false).await;
    seed(&stack.store, "s3", Some("e1")).await;

    let handle = stack.reaper.start();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    handle.stop().await;

    assert_eq!(status_of(&stack.store, "s3").await, SessionStatus::Idle);
}
