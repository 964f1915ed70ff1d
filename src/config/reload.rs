//! Configuration file watching and live reload.
//!
//! The watcher polls the file for changes and debounces bursts of writes,
//! then reloads and applies the diff to the live components. Bind
//! address, agent path, and data directories require a restart and are
//! pinned across reloads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{detect, Config, SharedConfig};
use crate::logging::LogHandle;
use crate::queue::TaskQueue;
use crate::webhook::WebhookNotifier;

/// How often the file is sampled.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Quiet period required before a change is applied, so bursts of writes
/// coalesce into one reload.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Live components the reload path mutates.
pub struct ReloadTargets {
    pub config: SharedConfig,
    pub queue: TaskQueue,
    pub webhooks: Arc<WebhookNotifier>,
    pub log_handle: LogHandle,
}

/// Background watcher over the configuration file.
pub struct ConfigWatcher {
    shutdown: CancellationToken,
}

impl ConfigWatcher {
    /// Spawn the watcher loop.
    pub fn spawn(path: PathBuf, targets: ReloadTargets) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        tokio::spawn(async move {
            let mut last_seen = snapshot(&path);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }

                let current = snapshot(&path);
                if current == last_seen {
                    continue;
                }

                // Debounce: wait until the file stops changing.
                let mut settled = current;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(DEBOUNCE) => {}
                    }
                    let now = snapshot(&path);
                    if now == settled {
                        break;
                    }
                    settled = now;
                }
                last_seen = settled;

                tracing::info!("Configuration file changed; reloading");
                if let Err(err) = apply_reload(&path, &targets).await {
                    tracing::warn!("Configuration reload failed: {}", err);
                }
            }
        });

        Self { shutdown }
    }

    /// Stop the watcher loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Reload the file and push the diff into the live components.
async fn apply_reload(path: &std::path::Path, targets: &ReloadTargets) -> anyhow::Result<()> {
    let mut incoming = Config::load_or_init(path)?;
    incoming.apply_env_overrides();

    if let Some(detected) = detect::detect_agent_paths(&incoming) {
        if detect::apply_detected(&mut incoming, &detected) {
            incoming.save(path)?;
        }
    }

    let mut live = targets.config.write().await;

    // These fields require a restart; keep the running values.
    incoming.port = live.port;
    incoming.host = live.host.clone();
    incoming.data_dir = live.data_dir.clone();
    incoming.log_file = live.log_file.clone();
    incoming.pid_file = live.pid_file.clone();

    if incoming == *live {
        tracing::debug!("Configuration unchanged after reload");
        return Ok(());
    }

    if incoming.task_queue.concurrency != live.task_queue.concurrency {
        tracing::info!(
            "Task queue concurrency: {} -> {}",
            live.task_queue.concurrency,
            incoming.task_queue.concurrency
        );
        targets.queue.set_concurrency(incoming.task_queue.concurrency);
    }
    if incoming.task_queue.default_timeout != live.task_queue.default_timeout {
        tracing::info!(
            "Task timeout: {}ms -> {}ms",
            live.task_queue.default_timeout,
            incoming.task_queue.default_timeout
        );
        targets
            .queue
            .set_default_timeout(incoming.task_queue.default_timeout);
    }
    if incoming.webhook != live.webhook {
        tracing::info!("Webhook configuration updated");
        targets.webhooks.update_config(incoming.webhook.clone()).await;
    }
    if incoming.log_level != live.log_level {
        targets.log_handle.set_level(&incoming.log_level);
    }

    *live = incoming;
    tracing::info!("Configuration reload applied");
    Ok(())
}

/// The file's current content. Content comparison (the file is small)
/// sidesteps coarse mtime granularity on some filesystems.
fn snapshot(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::RwLock;

    use super::*;
    use crate::executor::{ExecuteOptions, ExecutionOutcome, Executor};
    use crate::store::tasks::TaskStore;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        async fn execute(&self, _opts: ExecuteOptions) -> ExecutionOutcome {
            ExecutionOutcome {
                success: true,
                ..Default::default()
            }
        }
    }

    fn targets(dir: &std::path::Path, config: Config) -> ReloadTargets {
        let store = Arc::new(TaskStore::open(dir).unwrap());
        let webhooks = Arc::new(WebhookNotifier::new(config.webhook.clone()));
        let queue = TaskQueue::new(
            store,
            Arc::new(NoopExecutor),
            Arc::clone(&webhooks),
            config.task_queue.concurrency,
            config.task_queue.default_timeout,
        );
        ReloadTargets {
            config: Arc::new(RwLock::new(config)),
            queue,
            webhooks,
            log_handle: test_log_handle(),
        }
    }

    fn test_log_handle() -> LogHandle {
        // The global subscriber can only be installed once per process;
        // build a detached handle instead.
        use tracing_subscriber::{filter::EnvFilter, reload};
        let (_, handle) = reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(
            EnvFilter::new("info"),
        );
        LogHandle { reload: handle }
    }

    #[tokio::test]
    async fn test_apply_reload_updates_queue_settings() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config = Config {
            data_dir: dir.path().join("data"),
            ..Default::default()
        };
        config.save(&config_path).unwrap();
        let targets = targets(dir.path(), config.clone());
        assert_eq!(targets.queue.concurrency(), 3);

        let updated = Config {
            task_queue: crate::config::TaskQueueConfig {
                concurrency: 8,
                default_timeout: 120_000,
            },
            ..config
        };
        updated.save(&config_path).unwrap();

        apply_reload(&config_path, &targets).await.unwrap();
        assert_eq!(targets.queue.concurrency(), 8);
        assert_eq!(targets.queue.default_timeout_ms(), 120_000);
        assert_eq!(targets.config.read().await.task_queue.concurrency, 8);
    }

    #[tokio::test]
    async fn test_reload_pins_restart_only_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config = Config {
            port: 3100,
            data_dir: dir.path().join("data"),
            ..Default::default()
        };
        config.save(&config_path).unwrap();
        let targets = targets(dir.path(), config.clone());

        let updated = Config {
            port: 9999,
            host: "0.0.0.0".to_string(),
            data_dir: PathBuf::from("/elsewhere"),
            ..config
        };
        updated.save(&config_path).unwrap();

        apply_reload(&config_path, &targets).await.unwrap();
        let live = targets.config.read().await;
        assert_eq!(live.port, 3100);
        assert_eq!(live.host, "127.0.0.1");
        assert_eq!(live.data_dir, dir.path().join("data"));
    }

    #[tokio::test]
    async fn test_watcher_applies_change_after_debounce() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config = Config {
            data_dir: dir.path().join("data"),
            ..Default::default()
        };
        config.save(&config_path).unwrap();
        let targets = targets(dir.path(), config.clone());
        let shared = Arc::clone(&targets.config);
        let queue = targets.queue.clone();

        let watcher = ConfigWatcher::spawn(config_path.clone(), targets);

        // Wait out one poll so the watcher records the initial state.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let updated = Config {
            task_queue: crate::config::TaskQueueConfig {
                concurrency: 6,
                default_timeout: 300_000,
            },
            ..config
        };
        updated.save(&config_path).unwrap();

        // Poll (250ms) + debounce (500ms) + slack.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if queue.concurrency() == 6 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "reload never applied"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(shared.read().await.task_queue.concurrency, 6);
        watcher.stop();
    }
}
