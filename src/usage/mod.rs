//! Usage tracker: accumulates per-credential counters in memory, flushing
//! deltas to storage on an interval and resetting at a configurable,
//! timezone-aware daily boundary.

use crate::config::UsageConfig;
use crate::storage::Storage;
use chrono::{FixedOffset, Timelike, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counters for one usage key (typically a credential id), keyed by field
/// name (e.g. `requests`, `input_tokens`, `output_tokens`).
#[derive(Default)]
struct Counters {
    fields: DashMap<String, AtomicI64>,
}

impl Counters {
    fn increment(&self, field: &str, delta: i64) -> i64 {
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::AcqRel)
            + delta
    }

    fn snapshot(&self) -> BTreeMap<String, i64> {
        self.fields
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Acquire)))
            .collect()
    }

    fn reset(&self) {
        self.fields.clear();
    }
}

/// In-process, per-key additive usage counters, periodically persisted and
/// reset at a configured daily boundary.
pub struct UsageTracker {
    config: UsageConfig,
    storage: Arc<dyn Storage>,
    counters: DashMap<String, Arc<Counters>>,
    last_reset_date: std::sync::Mutex<chrono::NaiveDate>,
}

impl UsageTracker {
    pub fn new(config: UsageConfig, storage: Arc<dyn Storage>) -> Arc<Self> {
        let tz = tracker_offset(&config);
        let today = Utc::now().with_timezone(&tz).date_naive();
        Arc::new(Self {
            config,
            storage,
            counters: DashMap::new(),
            last_reset_date: std::sync::Mutex::new(today),
        })
    }

    pub fn increment(&self, key: &str, field: &str, delta: i64) -> i64 {
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Counters::default()))
            .increment(field, delta)
    }

    pub fn get(&self, key: &str) -> BTreeMap<String, i64> {
        self.counters.get(key).map(|c| c.snapshot()).unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.counters.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn flush_one(&self, key: &str, counters: &Counters) {
        for (field, value) in counters.snapshot() {
            if value == 0 {
                continue;
            }
            if let Err(e) = self.storage.increment_usage(key, &field, value).await {
                tracing::warn!(key, field, error = %e, "failed to persist usage counters");
                continue;
            }
        }
    }

    /// Flushes every key's counters to storage, then zeroes the in-memory
    /// tallies (storage already holds the running total).
    pub async fn flush_all(&self) {
        for entry in self.counters.iter() {
            self.flush_one(entry.key(), entry.value()).await;
        }
        for entry in self.counters.iter() {
            entry.value().reset();
        }
    }

    /// Checks whether the configured daily boundary has been crossed since
    /// the last check and, if so, resets storage-side counters for every
    /// known key and clears in-memory tallies.
    async fn maybe_reset_daily(&self) {
        let tz = tracker_offset(&self.config);
        let now = Utc::now().with_timezone(&tz);
        let today = now.date_naive();
        if now.time().hour() < self.config.reset_hour {
            return;
        }

        let mut last = self.last_reset_date.lock().unwrap_or_else(|p| p.into_inner());
        if *last >= today {
            return;
        }
        *last = today;
        drop(last);

        let keys: Vec<String> = match self.storage.list_usage().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list usage keys for daily reset");
                self.counters.iter().map(|e| e.key().clone()).collect()
            }
        };
        for key in keys {
            if let Err(e) = self.storage.reset_usage(&key).await {
                tracing::warn!(key, error = %e, "failed to reset usage counters");
            }
        }
        for entry in self.counters.iter() {
            entry.value().reset();
        }
        tracing::info!("usage counters reset at daily boundary");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = Duration::from_secs(self.config.persist_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        this.flush_all().await;
                        break;
                    }
                    _ = ticker.tick() => {
                        this.flush_all().await;
                        this.maybe_reset_daily().await;
                    }
                }
            }
        })
    }
}

fn tracker_offset(config: &UsageConfig) -> FixedOffset {
    FixedOffset::east_opt(config.reset_utc_offset_minutes * 60).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate_per_field() {
        let counters = Counters::default();
        counters.increment("requests", 1);
        counters.increment("requests", 1);
        counters.increment("input_tokens", 100);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.get("requests"), Some(&2));
        assert_eq!(snapshot.get("input_tokens"), Some(&100));
    }

    #[test]
    fn reset_clears_fields() {
        let counters = Counters::default();
        counters.increment("requests", 5);
        counters.reset();
        assert!(counters.snapshot().is_empty());
    }
}
