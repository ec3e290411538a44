//! Monitor core logic.
//!
//! This crate provides the evaluation side of the monitor:
//! - Engine: polls registered sources, keeps bounded per-source history
//! - Rule evaluation (absolute, percentage, max-pain proximity, price targets, opportunities)
//! - Edge-triggered alert deduplication with pluggable backends
//! - Daily digests
//! - Max-pain aggregation over stored liquidations
//!
//! Sources live in `monitor-api`, liquidation ingestion in `monitor-ingest`
//! and persistence in `monitor-store`.

pub mod config;
pub mod dedup;
mod engine;
pub mod format;
mod history;
pub mod keys;
mod maxpain;
pub mod rules;

pub use config::{
    ConfigError, EngineConfig, IngestConfig, MaxPainConfig, MonitorConfig, SourcesConfig,
};
pub use dedup::{DedupBackend, DedupError, Deduplicator, MemoryDedupBackend};
pub use engine::{Engine, EngineStats, FetchError};
pub use history::SnapshotHistory;
pub use maxpain::{MaxPainAggregator, MaxPainEntry, MaxPainSource};
