use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive_api::{admin_app, public_app, AppState};
use hive_bus::{run_event_writer, run_protocol_writer, EventBus, ProtocolRecorder};
use hive_config::{ensure_dirs, load_settings, Settings};
use hive_link::SshLink;
use hive_sched::run_reclaim_loop;
use hive_store::Store;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::CliFailure;

/// Run the control plane until SIGINT/SIGTERM.
pub async fn serve(config: Option<&Path>) -> Result<(), CliFailure> {
    let settings =
        load_settings(config).map_err(|e| CliFailure::new(2, anyhow::Error::new(e)))?;
    // An explicitly supplied key this short is a misconfiguration, not a
    // secret; refuse to expose the admin surface with it.
    if !settings.admin_key_generated && settings.admin_key.len() < 16 {
        return Err(CliFailure::new(
            4,
            anyhow::anyhow!("admin key too short; set at least 16 characters or unset to generate"),
        ));
    }
    ensure_dirs(&settings).map_err(|e| CliFailure::new(3, anyhow::Error::new(e)))?;
    init_logging(&settings).map_err(|e| CliFailure::new(1, e))?;

    if settings.admin_key_generated {
        info!(key = %settings.admin_key, "generated admin key for this run");
    }

    let store = Store::open(&settings.db_path())
        .map_err(|e| CliFailure::new(3, anyhow::Error::new(e)))?;

    run(store, settings)
        .await
        .map_err(|e| CliFailure::new(1, e))
}

async fn run(store: Store, settings: Settings) -> anyhow::Result<()> {
    let (bus, event_rx) = EventBus::new();
    let (recorder, protocol_rx) = ProtocolRecorder::new();
    let link = Arc::new(SshLink::new(settings.ssh_connect_timeout()));
    let state = AppState::build(
        store.clone(),
        bus.clone(),
        recorder,
        link,
        settings.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Write-behind sinks: their loops swallow and log their own errors.
    tokio::spawn(run_event_writer(
        store.clone(),
        event_rx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_protocol_writer(store, protocol_rx, shutdown_rx.clone()));

    // State-transition loops restart on panic with capped backoff.
    spawn_supervised("reclaim", shutdown_rx.clone(), {
        let scheduler = state.scheduler.clone();
        let shutdown = shutdown_rx.clone();
        move || run_reclaim_loop(scheduler.clone(), shutdown.clone())
    });
    spawn_supervised("self-heal", shutdown_rx.clone(), {
        let healer = state.healer.clone();
        let shutdown = shutdown_rx.clone();
        move || healer.clone().run(shutdown.clone())
    });

    let public_listener = TcpListener::bind(("0.0.0.0", settings.public_port))
        .await
        .with_context(|| format!("bind public port {}", settings.public_port))?;
    let admin_listener = TcpListener::bind(("0.0.0.0", settings.admin_port))
        .await
        .with_context(|| format!("bind admin port {}", settings.admin_port))?;
    info!(
        public = settings.public_port,
        admin = settings.admin_port,
        "hive listening"
    );

    tokio::spawn(watch_signals(shutdown_tx));

    let public = axum::serve(public_listener, public_app(state.clone()))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin = axum::serve(admin_listener, admin_app(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    tokio::try_join!(async { public.await }, async { admin.await })
        .context("listener failed")?;
    info!("hive stopped");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn watch_signals(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
}

/// Respawn a background loop when it panics, with exponential backoff capped
/// at one minute. A clean return (shutdown) ends supervision.
fn spawn_supervised<F, Fut>(name: &'static str, shutdown: watch::Receiver<bool>, mut make: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            let handle = tokio::spawn(make());
            match handle.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(task = name, "background loop panicked; restarting in {:?}", backoff);
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
                Err(_) => break,
            }
        }
    });
}

fn init_logging(settings: &Settings) -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(settings.log_path())
        .with_context(|| format!("open log file {}", settings.log_path().display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .try_init()
        .context("tracing init")?;
    Ok(())
}
