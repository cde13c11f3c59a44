//! txload Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use txload_common::logging::{init_logging, LogConfig};

use txload_server::{
    config::Config,
    dispatch::Dispatcher,
    loader::BatchLoader,
    orchestrator::EtlOrchestrator,
    pool,
    reader::ExportReader,
    schema::SchemaRegistry,
    server::{self, AppState, LastRun},
    store::{self, PgRecordStore},
    transport::{FtpConnector, SessionPool},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over the built-in defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("txload-server")
        .filter_directives("txload_server=debug,tower_http=info,sqlx=warn")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting txload server");

    let config = Config::load()?;
    info!(
        folders = config.etl.folders.len(),
        ftp_host = %config.ftp.host,
        "Configuration loaded - server will bind to {}:{}",
        config.http.host,
        config.http.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the database")?;

    info!("Database connection pool established");

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(SchemaRegistry::builtin()))?);

    if config.database.auto_create_tables {
        store::ensure_tables(&db_pool, dispatcher.registry())
            .await
            .context("Failed to create destination tables")?;
    }

    let sessions = SessionPool::connect(&FtpConnector::new(config.ftp_config()), config.etl.session_pool_size)
        .await
        .context("Failed to open FTP sessions")?;

    let orchestrator_config = config.orchestrator_config();
    let workers = pool::resolve_size(orchestrator_config.worker_pool_size);
    if workers > sessions.size() {
        warn!(
            workers,
            sessions = sessions.size(),
            "More workers than FTP sessions, effective concurrency is {}",
            sessions.size()
        );
    }

    let record_store = Arc::new(PgRecordStore::new(db_pool.clone(), config.etl.batch_size));
    let orchestrator = Arc::new(EtlOrchestrator::new(
        orchestrator_config,
        sessions.clone(),
        Arc::new(ExportReader::new(dispatcher)),
        Arc::new(BatchLoader::new(record_store, config.retry_policy())),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let last_run = LastRun::default();
    let runner = tokio::spawn(server::run_schedule(
        orchestrator,
        Duration::from_secs(config.etl.run_interval_secs),
        shutdown.clone(),
        last_run.clone(),
        || chrono::Local::now().date_naive(),
    ));

    let state = AppState {
        db: db_pool.clone(),
        last_run,
        shutdown: shutdown.clone(),
    };
    let app = server::router(state);

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped, waiting for the current run to finish");
    if let Err(e) = runner.await {
        warn!(error = %e, "Periodic runner ended abnormally");
    }

    sessions.close().await;
    db_pool.close().await;

    info!("Server shut down gracefully");

    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
