//! turnbus-daemon - runs the full bus in one process.
//!
//! Boots the stream log, the durable store (applying pending migrations),
//! and the object store, then serves the HTTP/SSE edge with a persister
//! worker draining the global stream in the background. SIGINT or SIGTERM
//! stops the HTTP server gracefully and signals the persister to finish
//! its pass and exit.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use turnbus_core::streamlog::StreamLog;

use turnbus_daemon::config::Config;
use turnbus_daemon::gateway::{GatewayConfig, IngestGateway};
use turnbus_daemon::http::{router, AppState};
use turnbus_daemon::objectstore::FsObjectStore;
use turnbus_daemon::persister::{Persister, PersisterConfig};
use turnbus_daemon::store::{migrations, DurableStore};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();
    let cfg = Config::from_env();
    match run(cfg).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "daemon failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = DurableStore::open(&cfg.store_path)?;
    let applied = migrations::apply_embedded(&store)?;
    if !applied.is_empty() {
        info!(versions = ?applied, "applied migrations");
    }

    let objects = FsObjectStore::new(&cfg.object_root, &cfg.object_bucket, &cfg.object_prefix)?;
    objects.ensure_bucket()?;

    let log = Arc::new(StreamLog::new());
    let gateway = IngestGateway::new(
        Arc::clone(&log),
        GatewayConfig {
            trim_max_len: cfg.trim_max_len,
            dedupe_ttl: cfg.dedupe_ttl,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut persister = Persister::new(
        Arc::clone(&log),
        Arc::new(store.clone()),
        PersisterConfig {
            group: cfg.persister_group.clone(),
            consumer: cfg.persister_consumer.clone(),
            max_retries: cfg.persister_max_retries,
            dlq_stream: cfg.persister_dlq_stream.clone(),
            tenant_id: cfg.tenant_id.clone(),
            idle_timeout_seconds: cfg.idle_timeout_seconds,
            ..PersisterConfig::default()
        },
    );
    let persister_task = tokio::spawn(async move { persister.run(shutdown_rx).await });

    let state = Arc::new(AppState {
        gateway,
        log,
        store,
        objects,
    });
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    info!(addr = %cfg.http_addr, "turnbus listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = persister_task.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
