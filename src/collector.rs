//! Periodic in-process sampler and statistics read-through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::config::StatisticsConfig;
use crate::store::statistics::{DailyRecord, ModelCounters, Statistics, StatsStore};
use crate::store::StoreError;

/// Samples process uptime and memory on an interval and fronts the
/// statistics store's read queries.
pub struct StatisticsCollector {
    statistics: Arc<StatsStore>,
    interval: Duration,
    enabled: bool,
    started: Instant,
    shutdown: CancellationToken,
}

impl StatisticsCollector {
    pub fn new(statistics: Arc<StatsStore>, config: &StatisticsConfig) -> Self {
        Self {
            statistics,
            interval: Duration::from_millis(config.collection_interval.max(1_000)),
            enabled: config.enabled,
            started: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the sampler loop. No-op when statistics are disabled.
    pub fn start(&self) {
        if !self.enabled {
            tracing::debug!("Statistics collector disabled");
            return;
        }

        let interval = self.interval;
        let started = self.started;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let uptime = started.elapsed().as_secs();
                let memory = process_memory_bytes().unwrap_or(0);
                tracing::debug!(
                    "Process sample: uptime {}s, resident memory {} bytes",
                    uptime,
                    memory
                );
            }
        });
        tracing::info!(
            "Statistics collector started (interval {}s)",
            interval.as_secs()
        );
    }

    /// Stop the sampler loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Seconds since the collector (and effectively the process) started.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub async fn summary(&self) -> Result<Statistics, StoreError> {
        self.statistics.summary().await
    }

    pub async fn daily(&self, limit: Option<usize>) -> Result<Vec<DailyRecord>, StoreError> {
        self.statistics.daily(limit).await
    }

    pub async fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        self.statistics.range(start, end).await
    }

    pub async fn top_models(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, ModelCounters)>, StoreError> {
        self.statistics.top_models(limit).await
    }
}

/// Resident set size of this process, when the platform exposes it.
pub fn process_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // /proc/self/statm: size resident shared text lib data dt (pages)
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(resident_pages * page_size as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::store::statistics::RequestRecord;

    #[tokio::test]
    async fn test_read_through_matches_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StatsStore::open(dir.path()).unwrap());
        store
            .record_request(RequestRecord {
                success: true,
                model: "sonnet".to_string(),
                cost_usd: 0.02,
                input_tokens: 1,
                output_tokens: 2,
            })
            .await
            .unwrap();

        let collector = StatisticsCollector::new(store, &StatisticsConfig::default());
        let summary = collector.summary().await.unwrap();
        assert_eq!(summary.requests.total, 1);

        let top = collector.top_models(5).await.unwrap();
        assert_eq!(top[0].0, "sonnet");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_memory_is_nonzero_on_linux() {
        assert!(process_memory_bytes().unwrap() > 0);
    }
}
