//! Real-time liquidation ingestion.
//!
//! This crate provides:
//! - Binance force-order stream parsing and REST backfill
//! - `LiquidationCollector`: buffered, batched persistence with reconnection
//! - `Backoff`: capped exponential reconnect delay
//! - `Shutdown`: cooperative cancellation signal shared by all long-lived tasks

pub mod backoff;
pub mod binance;
pub mod collector;
pub mod shutdown;

pub use backoff::Backoff;
pub use binance::{parse_force_order, BinanceFuturesClient};
pub use collector::{CollectorConfig, LiquidationCollector};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
