//! On-chain Metric Monitor
//!
//! Polls metric sources on a fixed cadence and pushes Telegram alerts.
//! Features:
//! - Absolute and percentage-change rules per subscription
//! - Edge-triggered deduplication backed by SQLite
//! - Daily digests in a fixed UTC offset
//! - Binance liquidation stream ingestion and max-pain levels

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use monitor_api::{BinanceSpotSource, FearGreedSource, MetricSource, TelegramNotifier};
use monitor_core::{Deduplicator, Engine, MaxPainAggregator, MaxPainSource, MonitorConfig};
use monitor_ingest::{shutdown_channel, LiquidationCollector};
use monitor_store::SqliteStore;

/// Environment variable names.
mod env {
    pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
    pub const DATABASE_PATH: &str = "DATABASE_PATH";
    pub const DEDUP_DATABASE_PATH: &str = "DEDUP_DATABASE_PATH";
}

const DEFAULT_DATABASE_PATH: &str = "monitor.db";

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,monitor_core=debug,monitor_ingest=debug")),
        )
        .init();

    // MONITOR_CONFIG (TOML path) or MONITOR_PROFILE: testing, production
    let monitor_config = MonitorConfig::load()?;
    monitor_config.log_config();

    let token = std::env::var(env::TELEGRAM_BOT_TOKEN)
        .map_err(|_| anyhow::anyhow!("Missing env var: {}", env::TELEGRAM_BOT_TOKEN))?;

    let db_path =
        std::env::var(env::DATABASE_PATH).unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
    let store = Arc::new(
        SqliteStore::open(&db_path).with_context(|| format!("open database {}", db_path))?,
    );
    info!(path = %db_path, "Database ready");

    let dedup_store = match std::env::var(env::DEDUP_DATABASE_PATH) {
        Ok(path) if !path.is_empty() && path != db_path => {
            let dedup = SqliteStore::open(&path)
                .with_context(|| format!("open dedup database {}", path))?;
            info!(path = %path, "Dedup database ready");
            Arc::new(dedup)
        }
        _ => Arc::clone(&store),
    };

    let notifier = Arc::new(TelegramNotifier::new(token)?);
    let aggregator = Arc::new(MaxPainAggregator::new(
        store.clone(),
        monitor_config.maxpain.clone(),
    ));

    let engine = Engine::new(
        store.clone(),
        notifier,
        Deduplicator::new(dedup_store),
        monitor_config.engine.clone(),
    )
    .with_maxpain(aggregator.clone());

    let sources = build_sources(&monitor_config, aggregator)?;
    for source in &sources {
        seed_events(&store, source.as_ref());
        engine.register(Arc::clone(source));
    }
    if let Err(e) = store.ensure_event(
        "general_maxpain_alert",
        "Price approaching a liquidation max-pain level",
        "General",
    ) {
        warn!(error = %e, "Failed to register max-pain event");
    }
    let engine = Arc::new(engine);

    let collector = Arc::new(LiquidationCollector::new(
        store.clone(),
        monitor_config.ingest.collector_config(),
    ));

    let (trigger, shutdown) = shutdown_channel();
    let engine_task = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));
    let collector_task = tokio::spawn(collector.run(shutdown));

    info!("Monitor running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    trigger.trigger();

    let (engine_res, collector_res) = tokio::join!(engine_task, collector_task);
    if let Err(e) = engine_res {
        error!(error = %e, "Engine task failed");
    }
    if let Err(e) = collector_res {
        error!(error = %e, "Collector task failed");
    }

    let stats = engine.stats();
    info!(
        polls_ok = stats.polls_ok,
        alerts_sent = stats.alerts_sent,
        alerts_deduplicated = stats.alerts_deduplicated,
        "Monitor stopped"
    );
    Ok(())
}

/// Built-in sources enabled by configuration.
fn build_sources(
    config: &MonitorConfig,
    aggregator: Arc<MaxPainAggregator>,
) -> Result<Vec<Arc<dyn MetricSource>>> {
    let mut sources: Vec<Arc<dyn MetricSource>> = Vec::new();
    if !config.sources.binance_symbols.is_empty() {
        sources.push(Arc::new(BinanceSpotSource::new(
            config.sources.binance_symbols.clone(),
        )?));
    }
    if config.sources.fear_greed {
        sources.push(Arc::new(FearGreedSource::new()?));
    }
    if config.sources.maxpain {
        sources.push(Arc::new(MaxPainSource::new(aggregator)));
    }
    Ok(sources)
}

/// Register the subscribable events a source produces.
fn seed_events(store: &SqliteStore, source: &dyn MetricSource) {
    let name = source.name();
    let category = source.category();
    let mut events = vec![
        (format!("{}_metric_alert", name), format!("{} metric alerts", name)),
        (format!("{}_daily_report", name), format!("{} daily digest", name)),
    ];
    if source.as_price_feed().is_some() {
        events.push((format!("general_{}_price_alert", name), format!("{} price targets", name)));
    }
    if source.as_opportunity_feed().is_some() {
        events.push((format!("general_{}_alert", name), format!("New {} opportunities", name)));
    }
    for (event, description) in events {
        if let Err(e) = store.ensure_event(&event, &description, category) {
            warn!(event = %event, error = %e, "Failed to register event");
        }
    }
}

/// Print startup banner.
fn print_banner() {
    println!(
        r#"
    ╔╦╗┌─┐┌┐┌┬┌┬┐┌─┐┬─┐
    ║║║│ │││││ │ │ │├┬┘
    ╩ ╩└─┘┘└┘┴ ┴ └─┘┴└─
    On-chain Metric Monitor v0.1.0
    "#
    );
}
