//! Global and per-day usage aggregates.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonDocument, StoreError};

/// Days of per-day history to retain.
const DAILY_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestCounters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenCounters {
    pub total_input: u64,
    pub total_output: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostCounters {
    pub total_usd: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelCounters {
    pub count: u64,
    pub cost_usd: f64,
}

/// One day of aggregates, keyed `YYYY-MM-DD` in UTC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyRecord {
    pub date: String,
    #[serde(default)]
    pub requests: RequestCounters,
    #[serde(default)]
    pub tokens: TokenCounters,
    #[serde(default)]
    pub costs: CostCounters,
    #[serde(default)]
    pub models: HashMap<String, ModelCounters>,
}

/// The singleton statistics document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(default)]
    pub requests: RequestCounters,
    #[serde(default)]
    pub tokens: TokenCounters,
    #[serde(default)]
    pub costs: CostCounters,
    #[serde(default)]
    pub models: HashMap<String, ModelCounters>,
    #[serde(default)]
    pub daily: Vec<DailyRecord>,
}

/// One recorded request attempt.
#[derive(Debug, Clone, Default)]
pub struct RequestRecord {
    pub success: bool,
    pub model: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Store for the statistics document, backed by `statistics.json`.
pub struct StatsStore {
    doc: JsonDocument<Statistics>,
}

impl StatsStore {
    /// Open (or create) the store at `dir/statistics.json`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            doc: JsonDocument::open(dir.join("statistics.json"))?,
        })
    }

    /// Record one request against today's UTC date.
    pub async fn record_request(&self, record: RequestRecord) -> Result<(), StoreError> {
        self.record_request_on(record, Utc::now().date_naive()).await
    }

    /// Record one request against an explicit date. Globals and the day
    /// record advance together; day records older than 90 days are pruned.
    pub async fn record_request_on(
        &self,
        record: RequestRecord,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        let day_key = date.format("%Y-%m-%d").to_string();
        let prune_cutoff = (date - chrono::Duration::days(DAILY_RETENTION_DAYS))
            .format("%Y-%m-%d")
            .to_string();

        self.doc
            .with_lock(move |stats| {
                apply_record(
                    &mut stats.requests,
                    &mut stats.tokens,
                    &mut stats.costs,
                    &mut stats.models,
                    &record,
                );

                let index = match stats.daily.iter().position(|d| d.date == day_key) {
                    Some(index) => index,
                    None => {
                        stats.daily.push(DailyRecord {
                            date: day_key.clone(),
                            ..Default::default()
                        });
                        stats.daily.len() - 1
                    }
                };
                let day = &mut stats.daily[index];
                apply_record(
                    &mut day.requests,
                    &mut day.tokens,
                    &mut day.costs,
                    &mut day.models,
                    &record,
                );

                // Lexicographic comparison works for YYYY-MM-DD keys.
                stats.daily.retain(|d| d.date >= prune_cutoff);
            })
            .await
    }

    /// Restore the document to its defaults.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.doc.with_lock(|stats| *stats = Statistics::default()).await
    }

    /// The full aggregate document (globals only, daily stripped).
    pub async fn summary(&self) -> Result<Statistics, StoreError> {
        self.doc
            .read(|stats| Statistics {
                requests: stats.requests,
                tokens: stats.tokens,
                costs: stats.costs,
                models: stats.models.clone(),
                daily: Vec::new(),
            })
            .await
    }

    /// Day records sorted by date descending.
    pub async fn daily(&self, limit: Option<usize>) -> Result<Vec<DailyRecord>, StoreError> {
        self.doc
            .read(|stats| {
                let mut days = stats.daily.clone();
                days.sort_by(|a, b| b.date.cmp(&a.date));
                if let Some(limit) = limit {
                    days.truncate(limit);
                }
                days
            })
            .await
    }

    /// Day records within `[start, end]`, ascending.
    pub async fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        let start_key = start.format("%Y-%m-%d").to_string();
        let end_key = end.format("%Y-%m-%d").to_string();
        self.doc
            .read(move |stats| {
                let mut days: Vec<DailyRecord> = stats
                    .daily
                    .iter()
                    .filter(|d| d.date >= start_key && d.date <= end_key)
                    .cloned()
                    .collect();
                days.sort_by(|a, b| a.date.cmp(&b.date));
                days
            })
            .await
    }

    /// Models sorted by request count descending.
    pub async fn top_models(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, ModelCounters)>, StoreError> {
        self.doc
            .read(move |stats| {
                let mut models: Vec<(String, ModelCounters)> = stats
                    .models
                    .iter()
                    .map(|(name, counters)| (name.clone(), *counters))
                    .collect();
                models.sort_by(|a, b| b.1.count.cmp(&a.1.count));
                models.truncate(limit);
                models
            })
            .await
    }
}

fn apply_record(
    requests: &mut RequestCounters,
    tokens: &mut TokenCounters,
    costs: &mut CostCounters,
    models: &mut HashMap<String, ModelCounters>,
    record: &RequestRecord,
) {
    requests.total += 1;
    if record.success {
        requests.successful += 1;
    } else {
        requests.failed += 1;
    }
    tokens.total_input += record.input_tokens;
    tokens.total_output += record.output_tokens;
    costs.total_usd += record.cost_usd;

    let model = models.entry(record.model.clone()).or_default();
    model.count += 1;
    model.cost_usd += record.cost_usd;
}
