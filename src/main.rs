use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use renditions::config::{AppConfig, StorageBackend};
use renditions::jobs::{RenderVariant, WorkerContext};
use renditions::middleware::build_rate_limiter;
use renditions::monitor::{spawn_lag_probe, QueueMonitor};
use renditions::object_store::{FsObjectStore, InMemoryObjectStore, ObjectStore};
use renditions::resolver::{ResolverConfig, VariantResolver};
use renditions::routes::{build_router, AppState};
use renditions::{Runner, DEFAULT_MAX_ATTEMPTS};

const BROKER_PING_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (cfg, migrate_only) = match AppConfig::from_env_and_args() {
        Ok(parsed) => parsed,
        Err(config_error) => {
            // Bad configuration is not recoverable; make the exit code say so.
            eprintln!("fatal configuration error: {config_error:#}");
            std::process::exit(1);
        }
    };

    info!(addr = %cfg.addr(), env = ?cfg.env, "starting rendition service");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    if migrate_only {
        info!("database migration complete");
        return Ok(());
    }

    let store: Arc<dyn ObjectStore> = match cfg.storage_backend {
        StorageBackend::File => Arc::new(FsObjectStore::new(&cfg.storage_dir)?),
        StorageBackend::Memory => Arc::new(InMemoryObjectStore::new()),
    };

    let resolver = VariantResolver::new(
        pool.clone(),
        store.clone(),
        ResolverConfig {
            bucket: cfg.bucket.clone(),
            public_base_url: cfg.public_base_url.clone(),
            job_max_attempts: DEFAULT_MAX_ATTEMPTS,
        },
    );

    let worker_context = WorkerContext::new(pool.clone(), store, cfg.max_requeues);
    let runner = Runner::new(pool.clone(), worker_context)
        .num_workers(cfg.worker_concurrency)
        .register::<RenderVariant>();
    let run_handle = runner.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker_monitor = tokio::spawn(
        QueueMonitor::new(pool.clone(), BROKER_PING_INTERVAL, shutdown_rx.clone()).run(),
    );
    let lag_probe = spawn_lag_probe(shutdown_rx);

    let limiter = build_rate_limiter(cfg.rate_limit_max, cfg.rate_limit_duration);
    let state = AppState {
        resolver,
        config: Arc::new(cfg.clone()),
        limiter,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&cfg.addr()).await?;
    info!("listening on http://{}", cfg.addr());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Edge stopped; drain the worker side in the same order: stop claiming,
    // wait for in-flight jobs, then drop connections.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    run_handle.shutdown();
    run_handle.wait_for_shutdown().await;
    broker_monitor.abort();
    lag_probe.abort();
    pool.close().await;

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!(%signal_error, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(signal_error) => {
                error!(%signal_error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
