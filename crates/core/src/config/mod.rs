//! Runtime configuration.
//!
//! Profiles (default, testing, production) selected by `MONITOR_PROFILE`,
//! or a TOML file pointed to by `MONITOR_CONFIG`.

mod monitor;

pub use monitor::{
    ConfigError, EngineConfig, IngestConfig, MaxPainConfig, MonitorConfig, SourcesConfig,
};
