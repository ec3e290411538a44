//! Max-pain estimation from stored liquidations.
//!
//! For each side, the price bucket holding the most liquidated notional over
//! an interval is treated as the level that would hurt that side the most.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use monitor_api::{format_num, MetricSource, Snapshot};
use monitor_store::LiquidationStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::MaxPainConfig;
use crate::rules::interval_secs;

pub(crate) const LINK: &str = "https://www.coinglass.com/liquidation-maxpain";
const SNAPSHOT_INTERVAL: &str = "24h";

/// Derived max-pain levels for one symbol and interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxPainEntry {
    pub symbol: String,
    /// Reference price (latest stored liquidation)
    pub price: f64,
    /// Bucket with the most long liquidations
    pub long_level: f64,
    /// Bucket with the most short liquidations
    pub short_level: f64,
    pub interval: String,
}

/// Computes and caches max-pain entries.
pub struct MaxPainAggregator {
    store: Arc<dyn LiquidationStore>,
    config: MaxPainConfig,
    cache: DashMap<(String, String), MaxPainEntry>,
}

impl MaxPainAggregator {
    pub fn new(store: Arc<dyn LiquidationStore>, config: MaxPainConfig) -> Self {
        Self {
            store,
            config,
            cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MaxPainConfig {
        &self.config
    }

    fn bin_width(&self, symbol: &str, price: f64) -> f64 {
        match self.config.bin_widths.get(symbol) {
            Some(&width) if width > 0.0 => width,
            _ => price * self.config.fallback_bin_pct / 100.0,
        }
    }

    /// Recompute the entry for `symbol` over `interval` and replace the cached one.
    #[instrument(skip(self))]
    pub async fn compute(&self, symbol: &str, interval: &str) -> Result<MaxPainEntry> {
        let symbol = symbol.to_uppercase();
        let price = self.store.latest_price(&symbol).await?;

        let mut entry = MaxPainEntry {
            symbol: symbol.clone(),
            interval: interval.to_string(),
            ..Default::default()
        };

        if price > 0.0 {
            let bin = self.bin_width(&symbol, price);
            let window = Duration::from_secs(interval_secs(interval));
            let buckets = self.store.query_max_pain(&symbol, window, bin).await?;
            entry.price = price;
            entry.long_level = buckets.long.price;
            entry.short_level = buckets.short.price;
            debug!(
                symbol = %symbol,
                price,
                bin,
                long = entry.long_level,
                short = entry.short_level,
                "Max-pain computed"
            );
        }

        self.cache
            .insert((symbol, interval.to_string()), entry.clone());
        Ok(entry)
    }

    /// Last computed entry, if any.
    pub fn cached(&self, symbol: &str, interval: &str) -> Option<MaxPainEntry> {
        self.cache
            .get(&(symbol.to_uppercase(), interval.to_string()))
            .map(|e| e.value().clone())
    }
}

/// Metric source publishing 24h max-pain levels for the configured symbols.
pub struct MaxPainSource {
    aggregator: Arc<MaxPainAggregator>,
}

impl std::fmt::Debug for MaxPainSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxPainSource")
            .field("symbols", &self.aggregator.config.symbols)
            .finish()
    }
}

impl MaxPainSource {
    pub fn new(aggregator: Arc<MaxPainAggregator>) -> Self {
        Self { aggregator }
    }

    async fn entries(&self) -> Result<Vec<MaxPainEntry>> {
        let mut entries = Vec::with_capacity(self.aggregator.config.symbols.len());
        for symbol in &self.aggregator.config.symbols {
            entries.push(self.aggregator.compute(symbol, SNAPSHOT_INTERVAL).await?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl MetricSource for MaxPainSource {
    fn name(&self) -> &str {
        "maxpain"
    }

    fn category(&self) -> &str {
        "General"
    }

    fn reference_link(&self) -> &str {
        LINK
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(self.name(), self.category());
        for e in self.entries().await? {
            let sym = &e.symbol;
            snapshot = snapshot
                .with_metric(format!("{sym}_price"), e.price, "Liquidations")
                .with_metric(format!("{sym}_long_maxpain"), e.long_level, "Liquidations")
                .with_metric(format!("{sym}_short_maxpain"), e.short_level, "Liquidations");
        }
        Ok(snapshot)
    }

    async fn fetch_digest(&self) -> Result<String> {
        let entries: Vec<MaxPainEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.price > 0.0)
            .collect();
        if entries.is_empty() {
            return Err(anyhow!("no max-pain data available"));
        }

        let mut text = format!(
            "📊 <b>Liquidation Max Pain Report ({SNAPSHOT_INTERVAL})</b> {}\n\n",
            Utc::now().format("%Y-%m-%d")
        );
        for e in &entries {
            let long_dist = (e.long_level - e.price) / e.price * 100.0;
            let short_dist = (e.short_level - e.price) / e.price * 100.0;
            text.push_str(&format!("{}  ${}\n", e.symbol, format_num(e.price)));
            text.push_str(&format!("  Long Max Pain:  ${} ({:+.1}%)\n", format_num(e.long_level), long_dist));
            text.push_str(&format!("  Short Max Pain: ${} ({:+.1}%)\n\n", format_num(e.short_level), short_dist));
        }
        text.push_str(&format!("🔗 {LINK}"));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_store::{LiquidationEvent, LiquidationSide, SqliteStore};

    async fn seeded_store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let now = Utc::now();
        let events = vec![
            LiquidationEvent::new("BTC", LiquidationSide::Long, 60_020.0, 2.0, "binance", now),
            LiquidationEvent::new("BTC", LiquidationSide::Long, 59_980.0, 1.0, "binance", now),
            LiquidationEvent::new("BTC", LiquidationSide::Long, 58_000.0, 0.1, "binance", now),
            LiquidationEvent::new("BTC", LiquidationSide::Short, 62_010.0, 1.0, "binance", now),
            LiquidationEvent::new("BTC", LiquidationSide::Short, 61_000.0, 0.2, "binance", now),
        ];
        store.insert_liquidation_events(&events).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_compute_uses_configured_bin() {
        let store = seeded_store().await;
        let agg = MaxPainAggregator::new(store, MaxPainConfig::default());

        let entry = agg.compute("btc", "24h").await.unwrap();
        assert_eq!(entry.symbol, "BTC");
        assert_eq!(entry.price, 61_000.0);
        assert_eq!(entry.long_level, 60_000.0);
        assert_eq!(entry.short_level, 62_000.0);
        assert_eq!(agg.cached("BTC", "24h"), Some(entry));
        assert!(agg.cached("BTC", "7d").is_none());
    }

    #[tokio::test]
    async fn test_no_data_gives_zero_entry() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let agg = MaxPainAggregator::new(store, MaxPainConfig::default());
        let entry = agg.compute("ETH", "24h").await.unwrap();
        assert_eq!(entry.price, 0.0);
        assert_eq!(entry.long_level, 0.0);
        assert_eq!(entry.short_level, 0.0);
    }

    #[test]
    fn test_fallback_bin_width() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let agg = MaxPainAggregator::new(store, MaxPainConfig::default());
        assert_eq!(agg.bin_width("BTC", 60_000.0), 100.0);
        assert_eq!(agg.bin_width("SOL", 200.0), 1.0);
    }

    #[tokio::test]
    async fn test_source_snapshot_and_digest() {
        let store = seeded_store().await;
        let agg = Arc::new(MaxPainAggregator::new(
            store,
            MaxPainConfig {
                symbols: vec!["BTC".into(), "ETH".into()],
                ..Default::default()
            },
        ));
        let source = MaxPainSource::new(agg);

        let snap = source.fetch_snapshot().await.unwrap();
        assert_eq!(snap.metric("BTC_long_maxpain"), Some(60_000.0));
        assert_eq!(snap.metric("ETH_price"), Some(0.0));

        let digest = source.fetch_digest().await.unwrap();
        assert!(digest.contains("BTC  $61,000.00"));
        assert!(!digest.contains("ETH"));
    }
}
