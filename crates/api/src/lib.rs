//! External collaborators of the metric monitor.
//!
//! This crate provides:
//! - `MetricSource`: the capability every polled feed implements, plus the
//!   optional `OpportunityFeed` and `PriceFeed` extensions
//! - `Notifier`: outbound delivery, with a Telegram implementation
//! - Concrete sources: Binance spot prices and the Crypto Fear & Greed index

mod binance;
mod feargreed;
mod format;
mod notifier;
mod source;
mod telegram;

pub use binance::BinanceSpotSource;
pub use feargreed::{classify_fear_greed, FearGreedSource};
pub use format::{add_commas, format_num};
pub use notifier::Notifier;
pub use source::{
    MetricSource, Opportunity, OpportunityFeed, OpportunityFilter, PriceFeed, Snapshot,
};
pub use telegram::{TelegramError, TelegramNotifier};
