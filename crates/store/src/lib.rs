//! Durable storage for the metric monitor.
//!
//! This crate provides:
//! - Record types: liquidation events, subscriptions, notification log
//! - `LiquidationStore`: batch inserts, max-pain bucketing, retention cleanup
//! - `SubscriptionStore`: rule lookup for the evaluation engine
//! - `SqliteStore`: SQLite implementation of both, plus the dedup key table
//!   and the subscription/event CRUD used by the API layer

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::{
    EventDefinition, LiquidationEvent, LiquidationSide, MaxPainBuckets, NotificationRecord,
    PriceBucket, RecipientId, Subscription, SubscriptionRule,
};

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Storage contract used by the liquidation ingestor and the max-pain aggregator.
#[async_trait]
pub trait LiquidationStore: Send + Sync {
    /// Insert a batch of events. Either the whole batch is stored or none of it.
    async fn insert_liquidation_events(&self, events: &[LiquidationEvent]) -> Result<()>;

    /// Highest-notional price bucket per side for `symbol` within `window`.
    async fn query_max_pain(
        &self,
        symbol: &str,
        window: Duration,
        bin_width: f64,
    ) -> Result<MaxPainBuckets>;

    /// Price of the most recent stored event for `symbol` (0 when none).
    async fn latest_price(&self, symbol: &str) -> Result<f64>;

    /// Delete events older than `age`, returning the number removed.
    async fn delete_events_older_than(&self, age: Duration) -> Result<u64>;
}

/// Storage contract used by the evaluation engine.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// All subscriptions (with rule parameters) to `event_name`.
    async fn subscribers_with_rules(&self, event_name: &str) -> Result<Vec<Subscription>>;

    /// Recipients subscribed to `event_name` whose digest hour equals `hour`.
    async fn digest_subscribers(&self, event_name: &str, hour: u32) -> Result<Vec<RecipientId>>;

    /// Append a delivered notification to the audit log.
    async fn log_notification(&self, record: &NotificationRecord) -> Result<()>;
}
