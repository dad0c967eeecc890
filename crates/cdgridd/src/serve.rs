//! The `serve` subcommand: assemble the subsystems and run until signalled.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cdgrid_api::{ApiState, build_router};
use cdgrid_coordinator::{Dispatcher, JobReaper, Poller};
use cdgrid_executor::{DockerExecutor, Executor, ScriptedExecutor};
use cdgrid_state::StateStore;

use crate::config::CdgridConfig;

/// Settings that only come from the command line or environment.
pub struct ServeOptions {
    pub dry_run: bool,
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
}

pub async fn run(mut config: CdgridConfig, opts: ServeOptions) -> anyhow::Result<()> {
    info!("cdgrid daemon starting");

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.db_path();
    let store = StateStore::open(&db_path)?.with_retention(config.store.retention());
    info!(path = ?db_path, retention_secs = config.store.retention_secs, "state store opened");

    let purged = store.purge_expired()?;
    if purged > 0 {
        info!(purged, "expired jobs purged at startup");
    }

    // ── Executor ───────────────────────────────────────────────

    let executor: Arc<dyn Executor> = if opts.dry_run {
        warn!("dry run: deployments are simulated, no containers are started");
        Arc::new(ScriptedExecutor::new())
    } else {
        config.executor.docker.username = opts.registry_username;
        config.executor.docker.password = opts.registry_password;
        info!(image = %config.executor.docker.image, "docker executor configured");
        Arc::new(DockerExecutor::new(config.executor.docker.clone()))
    };

    // ── Coordinator ────────────────────────────────────────────

    let poller = Poller::new(store.clone(), executor.clone(), &config.poller);
    let resumed = poller.resume().await?;
    info!(
        resumed,
        interval_secs = config.poller.interval_secs,
        "poller initialized"
    );

    let dispatcher = Dispatcher::new(store.clone(), executor, poller.clone())
        .with_self_target(&config.executor.self_target);

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = JobReaper::new(store.clone());
    let reap_interval = config.store.reap_interval();
    let reaper_handle = tokio::spawn(async move {
        reaper.run(reap_interval, shutdown_rx).await;
    });

    // ── API server ─────────────────────────────────────────────

    let access = config.access_policy()?;
    let router = build_router(ApiState::new(store, dispatcher, access));
    let addr = config.server.addr();
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;

    poller.stop_all().await;
    let _ = reaper_handle.await;

    info!("cdgrid daemon stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
