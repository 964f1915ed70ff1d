//! Webhook delivery of task and session lifecycle events.
//!
//! Events are POSTed as `{event, timestamp, data}` with automatic retry
//! for failed deliveries. Webhook failures are logged and reported to the
//! caller of [`WebhookNotifier::notify`], but never propagate to the task
//! or request that triggered them.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::store::sessions::Session;
use crate::store::tasks::Task;

/// User agent reported on every delivery.
const USER_AGENT: &str = "Claude-API-Server/1.0";
/// Ceiling on the backoff between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Outcome of one notification.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NotifyOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl NotifyOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Delivers lifecycle events over HTTP with retry and backoff.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: RwLock<WebhookConfig>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config: RwLock::new(config),
        }
    }

    /// Replace the cached configuration (hot reload).
    pub async fn update_config(&self, config: WebhookConfig) {
        *self.config.write().await = config;
    }

    /// Deliver `event` with `data` to `url_override` or the configured
    /// default URL.
    pub async fn notify(
        &self,
        event: &str,
        data: Value,
        url_override: Option<&str>,
    ) -> NotifyOutcome {
        let (enabled, default_url, timeout, retries) = {
            let config = self.config.read().await;
            (
                config.enabled,
                config.default_url.clone(),
                Duration::from_millis(config.timeout),
                config.retries.max(1),
            )
        };

        if !enabled {
            return NotifyOutcome::skipped("disabled");
        }
        let Some(url) = url_override.map(str::to_string).or(default_url) else {
            return NotifyOutcome::skipped("no_url");
        };

        let payload = json!({
            "event": event,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "data": data,
        });

        let mut last_error = None;
        for attempt in 1..=retries {
            if attempt > 1 {
                // 1s, 2s, 4s, ... capped at 10s.
                let backoff = Duration::from_millis(1000u64 << (attempt - 2).min(16));
                tokio::time::sleep(backoff.min(MAX_BACKOFF)).await;
            }

            match self
                .client
                .post(&url)
                .timeout(timeout)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(
                        "Delivered webhook {} to {} on attempt {}",
                        event,
                        url,
                        attempt
                    );
                    return NotifyOutcome {
                        success: true,
                        attempts: attempt,
                        status: Some(response.status().as_u16()),
                        ..Default::default()
                    };
                }
                Ok(response) => {
                    let status = response.status();
                    tracing::warn!(
                        "Webhook {} to {} returned {} on attempt {}/{}",
                        event,
                        url,
                        status,
                        attempt,
                        retries
                    );
                    last_error = Some(format!("HTTP {status}"));
                }
                Err(err) => {
                    tracing::warn!(
                        "Webhook {} to {} failed on attempt {}/{}: {}",
                        event,
                        url,
                        attempt,
                        retries,
                        err
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        NotifyOutcome {
            success: false,
            reason: Some("max_retries_exceeded".to_string()),
            attempts: retries,
            last_error,
            ..Default::default()
        }
    }

    pub async fn task_completed(&self, task: &Task) -> NotifyOutcome {
        self.notify(
            "task.completed",
            json!({
                "task_id": task.id,
                "status": task.status,
                "result": task.result,
                "cost_usd": task.cost_usd,
                "duration_ms": task.duration_ms,
            }),
            task.metadata.webhook_url.as_deref(),
        )
        .await
    }

    pub async fn task_failed(&self, task: &Task) -> NotifyOutcome {
        self.notify(
            "task.failed",
            json!({
                "task_id": task.id,
                "status": task.status,
                "error": task.error,
                "duration_ms": task.duration_ms,
            }),
            task.metadata.webhook_url.as_deref(),
        )
        .await
    }

    pub async fn task_timeout(&self, task: &Task) -> NotifyOutcome {
        self.notify(
            "task.timeout",
            json!({
                "task_id": task.id,
                "status": task.status,
                "error": task.error,
                "duration_ms": task.duration_ms,
            }),
            task.metadata.webhook_url.as_deref(),
        )
        .await
    }

    pub async fn task_cancelled(&self, task: &Task) -> NotifyOutcome {
        self.notify(
            "task.cancelled",
            json!({
                "task_id": task.id,
                "status": task.status,
            }),
            task.metadata.webhook_url.as_deref(),
        )
        .await
    }

    pub async fn session_created(&self, session: &Session) -> NotifyOutcome {
        self.notify(
            "session.created",
            json!({
                "session_id": session.id,
                "project_path": session.project_path,
                "model": session.model,
            }),
            None,
        )
        .await
    }

    pub async fn session_deleted(&self, session_id: Uuid) -> NotifyOutcome {
        self.notify("session.deleted", json!({ "session_id": session_id }), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Minimal webhook receiver: answers each connection with the status
    /// produced by `responder(hit_number)` and counts hits.
    async fn spawn_receiver(
        responder: impl Fn(u32) -> u16 + Send + Sync + 'static,
    ) -> (String, Arc<AtomicU32>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let status = responder(hit);
                let reason = if status == 200 { "OK" } else { "Error" };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        (format!("http://{addr}/hook"), hits)
    }

    fn config(retries: u32) -> WebhookConfig {
        WebhookConfig {
            enabled: true,
            default_url: None,
            timeout: 2_000,
            retries,
        }
    }

    #[tokio::test]
    async fn test_disabled_and_missing_url_short_circuit() {
        let notifier = WebhookNotifier::new(WebhookConfig {
            enabled: false,
            ..config(3)
        });
        let outcome = notifier.notify("task.completed", json!({}), None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("disabled"));

        let notifier = WebhookNotifier::new(config(3));
        let outcome = notifier.notify("task.completed", json!({}), None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("no_url"));
    }

    #[tokio::test]
    async fn test_delivery_succeeds_first_try() {
        let (url, hits) = spawn_receiver(|_| 200).await;
        let notifier = WebhookNotifier::new(config(3));

        let outcome = notifier
            .notify("task.completed", json!({"task_id": "t"}), Some(&url))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.status, Some(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (url, hits) = spawn_receiver(|hit| if hit < 3 { 500 } else { 200 }).await;
        let notifier = WebhookNotifier::new(config(5));

        let outcome = notifier.notify("task.failed", json!({}), Some(&url)).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_max_retries() {
        let (url, hits) = spawn_receiver(|_| 500).await;
        let notifier = WebhookNotifier::new(config(3));

        let outcome = notifier.notify("task.failed", json!({}), Some(&url)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("max_retries_exceeded"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.last_error.as_deref(), Some("HTTP 500 Internal Server Error"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_override_beats_default_url() {
        let (default_url, default_hits) = spawn_receiver(|_| 200).await;
        let (override_url, override_hits) = spawn_receiver(|_| 200).await;

        let notifier = WebhookNotifier::new(WebhookConfig {
            default_url: Some(default_url),
            ..config(1)
        });
        let outcome = notifier
            .notify("task.completed", json!({}), Some(&override_url))
            .await;

        assert!(outcome.success);
        assert_eq!(override_hits.load(Ordering::SeqCst), 1);
        assert_eq!(default_hits.load(Ordering::SeqCst), 0);
    }
}
