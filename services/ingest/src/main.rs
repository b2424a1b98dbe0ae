mod client;
mod dates;
mod descriptor;
mod fetcher;
mod orchestrator;
mod resolver;
mod retry;
mod sink;

use std::future::Future;
use std::sync::Arc;

use paysync_config::{init_tracing, SyncConfig};
use paysync_db::records::pg_repository::PgRecordRepository;
use paysync_db::sync::file_store::FileCheckpointStore;
use paysync_db::sync::models::RunStatus;
use tokio_util::sync::CancellationToken;

use crate::client::PaymentClient;
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = SyncConfig::from_env().expect("failed to load config");
    tracing::info!(service = "paysync-ingest", "starting");

    let pool = paysync_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    paysync_db::schema::ensure_schema(&pool)
        .await
        .expect("failed to prepare destination schema");

    let client = PaymentClient::new(config.source.clone()).expect("failed to create payment client");
    let repo = PgRecordRepository::new(pool);
    let store = FileCheckpointStore::new(config.checkpoint_path.clone());
    tracing::info!(checkpoint = %store.path().display(), "using checkpoint file");

    let orchestrator = Orchestrator::new(config, Arc::new(client), repo, store)
        .expect("invalid sync configuration");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on(shutdown_signal(), cancel.clone()));

    let summary = orchestrator.run(cancel).await;
    if summary.status == RunStatus::Aborted {
        tracing::error!(
            reason = summary.abort_reason.as_deref().unwrap_or("unknown"),
            "sync aborted"
        );
        std::process::exit(1);
    }
    tracing::info!("shutting down");
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("interrupt received, finishing current page"),
        _ = terminate => tracing::info!("terminate received, finishing current page"),
    }
}

async fn cancel_on(signal: impl Future<Output = ()>, cancel: CancellationToken) {
    signal.await;
    cancel.cancel();
}
