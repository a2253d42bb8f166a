use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lgtm_server::config::{Cli, Config};
use lgtm_server::gitlab::GitLabClient;
use lgtm_server::reviewers::ReviewerPolicy;
use lgtm_server::store::ApprovalStore;
use lgtm_server::{app_router, AppState, ApprovalProcessor, WorkerPool};

fn init_tracing(log_level: &str) {
    let (filter, invalid) = match EnvFilter::try_new(log_level) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(e) = invalid {
        warn!("Invalid log level {:?}: {}, using \"info\"", log_level, e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    info!(version = %lgtm_server::get_version(), "Starting LGTM merge gate");

    let config = Config::from_cli(cli).context("Invalid configuration")?;

    info!("Using approval database: {}", config.db_path.display());
    let store = ApprovalStore::open(&config.db_path).with_context(|| {
        format!(
            "Failed to open approval database at {}",
            config.db_path.display()
        )
    })?;

    let gitlab = GitLabClient::new(
        config.gitlab_url.clone(),
        config.private_token.clone(),
        config.merge_timeout,
    )?;

    let processor = Arc::new(ApprovalProcessor {
        policy: ReviewerPolicy::new(&config.reviewers_path),
        store,
        gitlab,
        threshold: config.threshold,
        keyword: config.approval_keyword.clone(),
    });

    info!(
        threshold = config.threshold.get(),
        keyword = %config.approval_keyword,
        reviewers = %config.reviewers_path.display(),
        "Approval policy"
    );

    let dispatcher = WorkerPool::start(processor.clone(), config.workers, config.queue_capacity);
    let app_state = Arc::new(AppState {
        processor,
        dispatcher,
    });

    let app = app_router(app_state.clone(), &config.hook_path);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(
        "Webhook server listening on 0.0.0.0:{}{}",
        config.port, config.hook_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app_state.dispatcher.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
