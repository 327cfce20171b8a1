//! quilld - leaderless replicated-SQLite node.
//!
//! Every node owns a full copy of its databases and accepts reads and
//! writes over HTTP/JSON. Committed writes are captured in-transaction,
//! published to a durable JetStream log, and replayed idempotently on
//! every peer; convergence is last-writer-wins on the rowid.

mod cli;
mod http;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quill_engine::{DatabaseOptions, Engine};
use quill_replication::RuleInterceptor;

use crate::cli::Cli;
use crate::http::{create_router, AppState};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    if let Err(error) = run(cli).await {
        tracing::error!(error = %format!("{error:#}"), "server error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let node = cli.node_name();
    let engine = Arc::new(Engine::new(node.clone()));

    let replication = cli.replication_config()?;
    let interceptor = match &cli.interceptor {
        Some(path) => Some(Arc::new(
            RuleInterceptor::load(path)
                .with_context(|| format!("failed to load interceptor {}", path.display()))?,
        ) as Arc<dyn quill_replication::ChangesetInterceptor>),
        None => None,
    };
    let outbox_base = cli.outbox_base_dir();

    for path in cli.database_paths() {
        let mut options = DatabaseOptions::new(&path)
            .with_max_connections(cli.max_connections)
            .from_latest_snapshot(cli.from_latest_snapshot);

        if let Some(config) = &replication {
            let mut config = config.clone();
            if let Some(base) = &outbox_base {
                let id = quill_types::DatabaseId::from_path(&path);
                config = config.with_outbox_dir(base.join(id.as_str()));
            }
            options = options.with_replication(config);
            if let Some(interceptor) = &interceptor {
                options = options.with_interceptor(Arc::clone(interceptor));
            }
        }

        engine
            .load(options)
            .await
            .with_context(|| format!("failed to load database {}", path.display()))?;
    }

    let router = create_router(AppState {
        engine: Arc::clone(&engine),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;

    tracing::info!(node, port = cli.port, "starting quilld HTTP server");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    engine.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => tracing::error!(%error, "failed to listen for SIGTERM"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::warn!("shutdown signal received");
}
