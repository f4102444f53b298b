use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_foreman::chats::ChatProcessor;
use agent_foreman::cli::{BinaryResolver, CliInvoker, HealthChecker};
use agent_foreman::config::ForemanConfig;
use agent_foreman::jobs::{JobScheduler, ProcessRegistry, SchedulerConfig};
use agent_foreman::store::{Database, LibSqlBackend};
use agent_foreman::tasks::{QueueKind, TaskProcessor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ForemanConfig::from_env().context("invalid configuration")?;

    // Initialize tracing: stderr, plus daily files when a log dir is set
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Agent Foreman starting");

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    info!(path = %config.db_path.display(), "Database ready");

    // Crash recovery: anything in flight when the last process died runs again
    for kind in [QueueKind::Task, QueueKind::Chat] {
        let reset = db.reset_in_progress_queue_items(kind).await?;
        if reset > 0 {
            warn!(kind = %kind, reset, "Re-queued items left in progress");
        }
    }

    // ── CLI adapter ──────────────────────────────────────────────────────
    let scratch_dir = config.work_dir.join(".scratch");
    std::fs::create_dir_all(&scratch_dir)
        .with_context(|| format!("creating scratch dir {}", scratch_dir.display()))?;
    let invoker = Arc::new(
        CliInvoker::new(BinaryResolver::with_store(Arc::clone(&db))).with_scratch_dir(scratch_dir),
    );
    let health = Arc::new(HealthChecker::new(
        BinaryResolver::with_store(Arc::clone(&db)),
        config.health_timeout,
    ));

    // ── Processors & scheduler ──────────────────────────────────────────
    let processes = ProcessRegistry::new();
    let tasks = Arc::new(TaskProcessor::new(
        Arc::clone(&db),
        invoker.clone(),
        processes.clone(),
        config.processor.clone(),
    ));
    let chats = Arc::new(ChatProcessor::new(
        Arc::clone(&db),
        invoker,
        processes.clone(),
        config.processor.clone(),
    ));
    let scheduler = JobScheduler::new(
        db,
        health,
        tasks,
        chats,
        processes,
        SchedulerConfig::from(&config),
    );
    scheduler.start();

    shutdown_signal().await;
    info!("Shutdown signal received, stopping");
    scheduler.stop();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGTERM");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
        }
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
    }
}
