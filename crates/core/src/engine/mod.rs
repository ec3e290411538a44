//! Evaluation engine.
//!
//! Polls every registered source on a fixed cadence, keeps a bounded history
//! per source, evaluates subscriptions against it and delivers alerts through
//! the dedup gate. Digests go out once per recipient, source and day.

mod alerts;
mod digest;
#[cfg(test)]
mod tests;

use chrono::{FixedOffset, Offset, Timelike, Utc};
use dashmap::DashMap;
use monitor_api::{MetricSource, Notifier, Snapshot};
use monitor_ingest::Shutdown;
use monitor_store::{NotificationRecord, RecipientId, SubscriptionStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::history::SnapshotHistory;
use crate::maxpain::MaxPainAggregator;

/// Why a bounded upstream call produced nothing.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch task aborted: {0}")]
    Task(String),
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

/// Counters since startup.
#[derive(Debug, Default)]
struct Counters {
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_failed: AtomicU64,
    alerts_deduplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub alerts_deduplicated: u64,
}

/// The polling and alerting engine.
pub struct Engine {
    sources: DashMap<String, Arc<dyn MetricSource>>,
    history: Mutex<HashMap<String, SnapshotHistory>>,
    store: Arc<dyn SubscriptionStore>,
    notifier: Arc<dyn Notifier>,
    dedup: Deduplicator,
    maxpain: Option<Arc<MaxPainAggregator>>,
    default_proximity_pct: f64,
    config: EngineConfig,
    digest_offset: FixedOffset,
    counters: Counters,
}

impl Engine {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        notifier: Arc<dyn Notifier>,
        dedup: Deduplicator,
        config: EngineConfig,
    ) -> Self {
        let digest_offset = FixedOffset::east_opt(config.digest_utc_offset_hours * 3600)
            .unwrap_or_else(|| {
                warn!(hours = config.digest_utc_offset_hours, "Invalid digest offset, using UTC");
                Utc.fix()
            });
        Self {
            sources: DashMap::new(),
            history: Mutex::new(HashMap::new()),
            store,
            notifier,
            dedup,
            maxpain: None,
            default_proximity_pct: 1.0,
            config,
            digest_offset,
            counters: Counters::default(),
        }
    }

    /// Enable max-pain proximity alerts.
    pub fn with_maxpain(mut self, aggregator: Arc<MaxPainAggregator>) -> Self {
        self.default_proximity_pct = aggregator.config().default_proximity_pct;
        self.maxpain = Some(aggregator);
        self
    }

    /// Add a source. A later registration under the same name replaces the earlier one.
    pub fn register(&self, source: Arc<dyn MetricSource>) {
        let name = source.name().to_string();
        if self.sources.insert(name.clone(), source).is_some() {
            warn!(source = %name, "Replaced previously registered source");
        } else {
            info!(source = %name, "Registered source");
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Distinct categories across registered sources.
    pub fn categories(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|e| e.value().category().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn latest_snapshot(&self, source: &str) -> Option<Arc<Snapshot>> {
        self.history.lock().get(source).and_then(|h| h.latest().cloned())
    }

    pub fn history_len(&self, source: &str) -> usize {
        self.history.lock().get(source).map_or(0, SnapshotHistory::len)
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            polls_ok: c.polls_ok.load(Ordering::Relaxed),
            polls_failed: c.polls_failed.load(Ordering::Relaxed),
            alerts_sent: c.alerts_sent.load(Ordering::Relaxed),
            alerts_failed: c.alerts_failed.load(Ordering::Relaxed),
            alerts_deduplicated: c.alerts_deduplicated.load(Ordering::Relaxed),
        }
    }

    /// Poll immediately, then every `poll_interval`, until shutdown.
    /// Due digests are checked after every cycle; the per-day dedup key keeps them single.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(
            sources = ?self.source_names(),
            interval = ?self.config.poll_interval(),
            "Engine starting"
        );
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }

            // Cycles run to completion so a delivered alert is always marked
            self.poll_cycle().await;

            let now = Utc::now().with_timezone(&self.digest_offset);
            let date = now.date_naive().format("%Y-%m-%d").to_string();
            self.send_due_digests(now.hour(), &date).await;

            if shutdown.is_triggered() {
                break;
            }
        }

        let stats = self.stats();
        info!(
            polls_ok = stats.polls_ok,
            polls_failed = stats.polls_failed,
            alerts_sent = stats.alerts_sent,
            alerts_failed = stats.alerts_failed,
            "Engine stopped"
        );
    }

    /// One pass over every source followed by the cross-cutting rules.
    #[instrument(skip(self))]
    pub async fn poll_cycle(&self) {
        for source in self.source_list() {
            let name = source.name().to_string();
            let fetch_source = Arc::clone(&source);
            let result = self
                .bounded(async move { fetch_source.fetch_snapshot().await })
                .await;

            let snapshot = match result {
                Ok(snapshot) => Arc::new(snapshot),
                Err(FetchError::Timeout(after)) => {
                    self.counters.polls_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %name, after = ?after, "Snapshot fetch timed out");
                    continue;
                }
                Err(e) => {
                    self.counters.polls_failed.fetch_add(1, Ordering::Relaxed);
                    error!(source = %name, error = %e, "Snapshot fetch failed");
                    continue;
                }
            };
            self.counters.polls_ok.fetch_add(1, Ordering::Relaxed);
            debug!(source = %name, metrics = ?snapshot.metrics, "Snapshot");

            let history = self.record(&name, Arc::clone(&snapshot));
            self.evaluate_metric_rules(source.as_ref(), &snapshot, &history)
                .await;
        }

        self.check_maxpain().await;
        self.check_opportunities().await;
        self.check_price_targets().await;
    }

    /// Append to the source's history; returns the window oldest-first.
    fn record(&self, source: &str, snapshot: Arc<Snapshot>) -> Vec<Arc<Snapshot>> {
        let mut all = self.history.lock();
        let history = all
            .entry(source.to_string())
            .or_insert_with(|| SnapshotHistory::new(self.config.history_len));
        history.push(snapshot);
        history.snapshots()
    }

    fn source_list(&self) -> Vec<Arc<dyn MetricSource>> {
        self.sources.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Run `fut` on its own task, bounded by the fetch timeout. A late result is discarded.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, FetchError>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let limit = self.config.fetch_timeout();
        match tokio::time::timeout(limit, tokio::spawn(fut)).await {
            Ok(Ok(result)) => result.map_err(FetchError::Source),
            Ok(Err(join)) => Err(FetchError::Task(join.to_string())),
            Err(_) => Err(FetchError::Timeout(limit)),
        }
    }

    /// Send one message; on success append it to the audit log.
    async fn deliver(&self, recipient: RecipientId, text: &str, record: NotificationRecord) -> bool {
        match self.notifier.send(recipient, text).await {
            Ok(()) => {
                self.counters.alerts_sent.fetch_add(1, Ordering::Relaxed);
                info!(
                    recipient,
                    alert_type = %record.alert_type,
                    event = %record.event_name,
                    summary = %record.summary,
                    "Notification sent"
                );
                if let Err(e) = self.store.log_notification(&record).await {
                    error!(recipient, error = %e, "Failed to log notification");
                }
                true
            }
            Err(e) => {
                self.counters.alerts_failed.fetch_add(1, Ordering::Relaxed);
                error!(recipient, event = %record.event_name, error = %e, "Notification failed");
                false
            }
        }
    }

    fn count_deduplicated(&self) {
        self.counters
            .alerts_deduplicated
            .fetch_add(1, Ordering::Relaxed);
    }
}
