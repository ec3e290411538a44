//! Persisted record types shared by the ingestor, the engine and the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recipient identity (Telegram chat id).
pub type RecipientId = i64;

/// Which position type was force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiquidationSide {
    /// A long position was liquidated (exchange SELL order)
    Long,
    /// A short position was liquidated (exchange BUY order)
    Short,
}

impl LiquidationSide {
    /// Map the exchange order side of a forced liquidation to the closed position.
    pub fn from_order_side(side: &str) -> Option<Self> {
        match side {
            "SELL" => Some(Self::Long),
            "BUY" => Some(Self::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

impl fmt::Display for LiquidationSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single forced liquidation observed on an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    /// Base asset symbol, e.g. "BTC"
    pub symbol: String,
    /// Liquidated position side
    pub side: LiquidationSide,
    /// Execution price
    pub price: f64,
    /// Executed quantity (base asset)
    pub quantity: f64,
    /// price * quantity
    pub usd_value: f64,
    /// Venue name, e.g. "binance"
    pub exchange: String,
    /// Exchange-reported trade time
    pub event_time: DateTime<Utc>,
}

impl LiquidationEvent {
    pub fn new(
        symbol: impl Into<String>,
        side: LiquidationSide,
        price: f64,
        quantity: f64,
        exchange: impl Into<String>,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            price,
            quantity,
            usd_value: price * quantity,
            exchange: exchange.into(),
            event_time,
        }
    }
}

/// Price bucket with the cumulative liquidated notional inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceBucket {
    pub price: f64,
    pub usd_value: f64,
}

/// Highest-notional bucket per side. A zero bucket means "no data for this side".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxPainBuckets {
    pub long: PriceBucket,
    pub short: PriceBucket,
}

/// Monitorable event (e.g. "binance_metric_alert", "feargreed_daily_report").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub enabled: bool,
}

/// Rule parameters attached to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRule {
    /// Percentage threshold for change-based rules (10 = 10%)
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: f64,
    /// Comparison window, in poll cycles
    #[serde(default = "default_window")]
    pub window: i64,
    /// drop / increase / higher / lower / long / short / decrease, or a token filter
    #[serde(default = "default_direction")]
    pub direction: String,
    /// Absolute threshold (or proximity %, min APR, target price depending on the event)
    #[serde(default)]
    pub threshold_value: f64,
    /// Hour of day (in the digest offset) for scheduled digests
    #[serde(default = "default_digest_hour")]
    pub digest_hour: u32,
    /// Free-form filter token (coin symbol or category tag)
    #[serde(default)]
    pub coin: String,
}

fn default_threshold_pct() -> f64 {
    10.0
}
fn default_window() -> i64 {
    1
}
fn default_direction() -> String {
    "drop".to_string()
}
fn default_digest_hour() -> u32 {
    8
}

impl Default for SubscriptionRule {
    fn default() -> Self {
        Self {
            threshold_pct: default_threshold_pct(),
            window: default_window(),
            direction: default_direction(),
            threshold_value: 0.0,
            digest_hour: default_digest_hour(),
            coin: String::new(),
        }
    }
}

/// A recipient's subscription to an event, with its rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub recipient: RecipientId,
    pub event_name: String,
    pub rule: SubscriptionRule,
}

/// Audit record written after each delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub recipient: RecipientId,
    pub alert_type: String,
    pub event_name: String,
    pub summary: String,
    pub sent_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        recipient: RecipientId,
        alert_type: impl Into<String>,
        event_name: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            alert_type: alert_type.into(),
            event_name: event_name.into(),
            summary: summary.into(),
            sent_at: Utc::now(),
        }
    }
}
