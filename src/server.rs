//! Process assembly: startup sequence, signal handling, and shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::RwLock;

use crate::api::routes::{build_router, AppState};
use crate::collector::StatisticsCollector;
use crate::config::reload::{ConfigWatcher, ReloadTargets};
use crate::config::{detect, Config};
use crate::executor::CliExecutor;
use crate::queue::TaskQueue;
use crate::rate_limit::RateLimiter;
use crate::store::sessions::SessionStore;
use crate::store::statistics::StatsStore;
use crate::store::tasks::TaskStore;
use crate::webhook::WebhookNotifier;

/// Ceiling on the entire shutdown sequence; beyond it the process is
/// forced down with exit code 1.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(10);

/// Load configuration, assemble every component, and serve until a
/// shutdown signal arrives.
pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let mut config = Config::load_or_init(&config_path)?;
    config.apply_env_overrides();

    let log_handle = crate::logging::init(&config.log_level, Some(&config.log_file))?;

    if crate::config::running_as_root() && !config.enable_root_compatibility {
        anyhow::bail!(
            "refusing to run as root; set enableRootCompatibility in {} to override",
            config_path.display()
        );
    }

    config
        .ensure_directories()
        .context("failed to create data directories")?;

    if let Some(detected) = detect::detect_agent_paths(&config) {
        if detect::apply_detected(&mut config, &detected) {
            tracing::info!("Detected agent CLI at {}", detected.agent_path);
            config.save(&config_path)?;
        }
    }
    if config.agent_path.is_none() {
        tracing::warn!("No agent CLI found; sync and async execution will fail until one is configured");
    }

    let sessions = Arc::new(SessionStore::open(&config.data_dir.join("sessions"))?);
    let tasks = Arc::new(TaskStore::open(&config.data_dir.join("tasks"))?);
    let statistics = Arc::new(StatsStore::open(&config.data_dir.join("statistics"))?);

    let retention_days = config.session_retention_days;
    let bind_addr = format!("{}:{}", config.host, config.port);
    let pid_file = config.pid_file.clone();
    let queue_config = config.task_queue.clone();
    let webhook_config = config.webhook.clone();
    let statistics_config = config.statistics.clone();
    let shared_config = Arc::new(RwLock::new(config));

    let executor = Arc::new(CliExecutor::new(
        Arc::clone(&shared_config),
        Arc::clone(&sessions),
        Arc::clone(&statistics),
    ));
    let webhooks = Arc::new(WebhookNotifier::new(webhook_config));
    let queue = TaskQueue::new(
        Arc::clone(&tasks),
        executor.clone(),
        Arc::clone(&webhooks),
        queue_config.concurrency,
        queue_config.default_timeout,
    );
    queue.start().await?;

    let collector = Arc::new(StatisticsCollector::new(
        Arc::clone(&statistics),
        &statistics_config,
    ));
    collector.start();

    // One retention sweep per process start.
    match sessions.cleanup(retention_days).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!("Retention sweep removed {} session(s)", removed),
        Err(err) => tracing::warn!("Session retention sweep failed: {}", err),
    }
    match tasks.cleanup(retention_days).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!("Retention sweep removed {} task(s)", removed),
        Err(err) => tracing::warn!("Task retention sweep failed: {}", err),
    }

    let watcher = ConfigWatcher::spawn(
        config_path.clone(),
        ReloadTargets {
            config: Arc::clone(&shared_config),
            queue: queue.clone(),
            webhooks: Arc::clone(&webhooks),
            log_handle,
        },
    );

    std::fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", pid_file.display()))?;

    let state = Arc::new(AppState {
        config: shared_config,
        sessions,
        tasks,
        statistics,
        queue: queue.clone(),
        webhooks,
        executor,
        collector: Arc::clone(&collector),
        rate_limiter: RateLimiter::new(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        // Watchdog over the entire shutdown sequence, connection drain
        // included. Dies with the process on a clean exit.
        tokio::spawn(async {
            tokio::time::sleep(SHUTDOWN_WATCHDOG).await;
            tracing::error!(
                "Shutdown exceeded {}s; forcing exit",
                SHUTDOWN_WATCHDOG.as_secs()
            );
            std::process::exit(1);
        });
    })
    .await?;

    watcher.stop();
    collector.stop();
    queue.stop().await;

    if let Err(err) = std::fs::remove_file(&pid_file) {
        tracing::warn!("Failed to remove pid file {}: {}", pid_file.display(), err);
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT.
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
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", err);
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
