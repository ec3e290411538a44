//! Metric source capability and the snapshot it produces.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Point-in-time reading from one source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Source identity (e.g. "binance")
    pub source: String,
    /// Category label (e.g. "General")
    pub category: String,
    /// Metric name -> value
    pub metrics: BTreeMap<String, f64>,
    /// Metric name -> provenance label
    pub provenance: BTreeMap<String, String>,
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(source: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            category: category.into(),
            metrics: BTreeMap::new(),
            provenance: BTreeMap::new(),
            fetched_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64, provenance: impl Into<String>) -> Self {
        let name = name.into();
        self.provenance.insert(name.clone(), provenance.into());
        self.metrics.insert(name, value);
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// A polled data feed.
#[async_trait]
pub trait MetricSource: Send + Sync + Debug {
    /// Unique source name, used in event names and dedup keys.
    fn name(&self) -> &str;

    fn category(&self) -> &str;

    /// Human-facing link appended to alerts.
    fn reference_link(&self) -> &str;

    async fn fetch_snapshot(&self) -> Result<Snapshot>;

    /// Text for the scheduled daily digest.
    async fn fetch_digest(&self) -> Result<String>;

    fn as_opportunity_feed(&self) -> Option<&dyn OpportunityFeed> {
        None
    }

    fn as_price_feed(&self) -> Option<&dyn PriceFeed> {
        None
    }
}

/// Yield or listing opportunity exposed by an opportunity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Stable identity used for dedup
    pub id: String,
    pub name: String,
    /// Category tag (e.g. "LEND")
    pub tag: String,
    pub tvl: f64,
    pub apr: f64,
    pub chain: String,
    pub protocol: String,
    pub link: String,
    pub stablecoin: bool,
}

/// Per-subscription opportunity filter.
#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityFilter {
    pub min_apr: f64,
    pub min_tvl: f64,
    /// Upper-cased tag list, or "ALL"
    pub tag: String,
    /// "stablecoin", "non-stablecoin" or "any"
    pub token: String,
}

impl OpportunityFilter {
    pub fn matches(&self, opp: &Opportunity) -> bool {
        if opp.apr < self.min_apr || opp.tvl < self.min_tvl {
            return false;
        }
        if self.tag != "ALL" && !self.tag.split(',').any(|t| t.trim() == opp.tag) {
            return false;
        }
        match self.token.as_str() {
            "stablecoin" => opp.stablecoin,
            "non-stablecoin" => !opp.stablecoin,
            _ => true,
        }
    }
}

/// Source that also lists opportunities (served from its last fetch).
pub trait OpportunityFeed: Send + Sync {
    fn opportunities(&self, filter: &OpportunityFilter) -> Vec<Opportunity>;
}

/// Source that can quote a spot price on demand.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Price of `symbol` (base asset, e.g. "BTC") in USD.
    async fn fetch_price(&self, symbol: &str) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opp(tag: &str, apr: f64, tvl: f64, stablecoin: bool) -> Opportunity {
        Opportunity {
            id: "1".into(),
            name: "USDC vault".into(),
            tag: tag.into(),
            tvl,
            apr,
            chain: "Ethereum".into(),
            protocol: "Morpho".into(),
            link: String::new(),
            stablecoin,
        }
    }

    fn filter(tag: &str, token: &str) -> OpportunityFilter {
        OpportunityFilter {
            min_apr: 10.0,
            min_tvl: 1_000_000.0,
            tag: tag.into(),
            token: token.into(),
        }
    }

    #[test]
    fn test_filter_thresholds() {
        let f = filter("ALL", "any");
        assert!(f.matches(&opp("LEND", 12.0, 2_000_000.0, true)));
        assert!(!f.matches(&opp("LEND", 8.0, 2_000_000.0, true)));
        assert!(!f.matches(&opp("LEND", 12.0, 500_000.0, true)));
    }

    #[test]
    fn test_filter_tag_and_token() {
        assert!(filter("LEND,HOLD", "any").matches(&opp("HOLD", 12.0, 2e6, false)));
        assert!(!filter("LEND", "any").matches(&opp("BORROW", 12.0, 2e6, false)));
        assert!(!filter("ALL", "stablecoin").matches(&opp("LEND", 12.0, 2e6, false)));
        assert!(!filter("ALL", "non-stablecoin").matches(&opp("LEND", 12.0, 2e6, true)));
    }

    #[test]
    fn test_snapshot_builder() {
        let snap = Snapshot::new("binance", "General").with_metric("btc_price", 50_000.0, "Binance");
        assert_eq!(snap.metric("btc_price"), Some(50_000.0));
        assert_eq!(snap.provenance.get("btc_price").map(String::as_str), Some("Binance"));
        assert_eq!(snap.metric("eth_price"), None);
    }
}
