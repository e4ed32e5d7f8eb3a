// relay: multiplexes front-end clients onto sandboxed agent sessions.

use clap::Parser;
use relay::config::{RelayConfig, load_config, load_config_from_path};
use relay::environment::StaticEnvironmentService;
use relay::hub::{HubContext, HubOptions};
use relay::hub_manager::HubManager;
use relay::journal::Journal;
use relay::reaper::{IdleReaper, ReaperConfig};
use relay::sandbox::{LocalSandboxConfig, LocalSandboxManager};
use relay::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Agent relay between clients and sandboxed sessions")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    tokio::runtime::Runtime::new()?.block_on(run(cfg))
}

async fn run(cfg: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(std::path::Path::new(&cfg.store.sqlite_path))?.into_shared();
    let journal = Journal::new(Arc::clone(&store));
    let sandbox = Arc::new(LocalSandboxManager::new(LocalSandboxConfig {
        agent_program: cfg.sandbox.agent_program.clone(),
        agent_args: cfg.sandbox.agent_args.clone(),
        state_root: cfg.sandbox.state_root.clone(),
        reconnect: cfg.sandbox.reconnect.clone(),
    }));
    let environments = Arc::new(StaticEnvironmentService::new(cfg.environments.clone()));

    let ctx = HubContext {
        store: Arc::clone(&store),
        journal: journal.clone(),
        sandbox: sandbox.clone(),
        environments: environments.clone(),
    };
    let manager = HubManager::new(
        ctx,
        HubOptions {
            detach_grace: cfg.hub.detach_grace,
        },
    );

    let reaper = IdleReaper::new(
        Arc::clone(&store),
        Arc::clone(&manager),
        sandbox,
        environments,
        ReaperConfig {
            check_interval: cfg.reaper.check_interval,
        },
    );
    let reaper_handle = reaper.start();

    // Periodic prune of archived sessions' history.
    let prune_journal = journal.clone();
    let prune_max_age = cfg.journal.prune_max_age;
    let prune_interval = cfg.journal.prune_interval;
    let pruner = tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(prune_max_age).unwrap_or(chrono::Duration::days(30));
            match prune_journal.prune_older_than(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(deleted = n, "pruned archived session events"),
                Err(e) => warn!(error = %e, "journal prune failed"),
            }
        }
    });

    let router = relay::http::build_router(store, Arc::clone(&manager));
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
    info!(bind = %cfg.server.bind, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    pruner.abort();
    reaper_handle.stop().await;
    manager.close_all().await;
    info!("relay stopped");
    Ok(())
}
