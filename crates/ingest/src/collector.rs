//! Liquidation collector.
//!
//! Streams force orders over a persistent WebSocket, buffers them in memory
//! and flushes them to the store in batches. A failed flush puts the batch
//! back at the head of the buffer so nothing is lost.

use anyhow::{Context, Result};
use futures::StreamExt;
use monitor_store::{LiquidationEvent, LiquidationStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::binance::{self, BinanceFuturesClient};
use crate::shutdown::Shutdown;

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Stream base URL
    pub ws_base: String,
    /// REST base URL used for backfill
    pub rest_base: String,
    /// Tracked pairs, e.g. "btcusdt"
    pub symbols: Vec<String>,
    pub flush_interval: Duration,
    pub cleanup_interval: Duration,
    /// Events older than this are deleted by the cleanup loop
    pub retention: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Fetch recent liquidations over REST before streaming
    pub backfill: bool,
    pub backfill_limit: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ws_base: binance::DEFAULT_WS_BASE.to_string(),
            rest_base: binance::DEFAULT_REST_BASE.to_string(),
            symbols: vec!["btcusdt".to_string(), "ethusdt".to_string()],
            flush_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(30 * 24 * 3600),
            reconnect_base: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            backfill: true,
            backfill_limit: 100,
        }
    }
}

/// Buffered liquidation ingestor.
pub struct LiquidationCollector {
    store: Arc<dyn LiquidationStore>,
    config: CollectorConfig,
    buffer: Mutex<Vec<LiquidationEvent>>,
}

impl LiquidationCollector {
    pub fn new(store: Arc<dyn LiquidationStore>, config: CollectorConfig) -> Self {
        Self {
            store,
            config,
            buffer: Mutex::new(Vec::with_capacity(128)),
        }
    }

    /// Run until shutdown: backfill, start the flush/cleanup tickers, then
    /// stream with capped-backoff reconnects. Flushes once more before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let url = binance::stream_url(&self.config.ws_base, &self.config.symbols);
        info!(symbols = ?self.config.symbols, url = %url, "Liquidation collector starting");

        if self.config.backfill {
            self.backfill().await;
        }

        let flush_task = tokio::spawn(Arc::clone(&self).flush_loop(shutdown.clone()));
        let cleanup_task = tokio::spawn(Arc::clone(&self).cleanup_loop(shutdown.clone()));

        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);
        while !shutdown.is_triggered() {
            let result = tokio::select! {
                r = self.connect_and_read(&url, &mut backoff) => r,
                _ = shutdown.wait() => break,
            };

            let delay = backoff.next_delay();
            match result {
                Ok(()) => warn!(backoff = ?delay, "Liquidation stream closed, reconnecting"),
                Err(e) => warn!(error = %e, backoff = ?delay, "Liquidation stream failed, reconnecting"),
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait() => break,
            }
        }

        let _ = flush_task.await;
        let _ = cleanup_task.await;
        self.flush().await;
        info!("Liquidation collector stopped");
    }

    async fn connect_and_read(&self, url: &str, backoff: &mut Backoff) -> Result<()> {
        let (ws, _) = connect_async(url).await.context("ws connect")?;
        backoff.reset();
        info!("Liquidation stream connected");

        let (_write, mut read) = ws.split();
        while let Some(msg) = read.next().await {
            match msg.context("ws read")? {
                Message::Text(text) => self.handle_message(&text),
                Message::Binary(bytes) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        self.handle_message(text);
                    }
                }
                Message::Close(frame) => {
                    debug!(frame = ?frame, "Close frame received");
                    return Ok(());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parse a raw stream message and buffer it if it is a usable liquidation.
    pub fn handle_message(&self, text: &str) {
        if let Some(event) = binance::parse_force_order(text) {
            self.buffer.lock().push(event);
        }
    }

    /// Number of events waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Persist the buffer as one batch. On failure the batch is re-queued ahead of newer events.
    pub async fn flush(&self) {
        let events = std::mem::take(&mut *self.buffer.lock());
        if events.is_empty() {
            return;
        }

        match self.store.insert_liquidation_events(&events).await {
            Ok(()) => debug!(count = events.len(), "Flushed liquidation events"),
            Err(e) => {
                warn!(count = events.len(), error = %e, "Flush failed, re-buffering");
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, events);
                buffer.extend(newer);
            }
        }
    }

    /// Delete events older than the retention horizon.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) {
        match self.store.delete_events_older_than(self.config.retention).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Cleaned up old liquidation events"),
            Err(e) => error!(error = %e, "Liquidation cleanup failed"),
        }
    }

    async fn backfill(&self) {
        let client = match BinanceFuturesClient::new(&self.config.rest_base, Duration::from_secs(10)) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Backfill client unavailable");
                return;
            }
        };

        for pair in &self.config.symbols {
            match client.recent_force_orders(pair, self.config.backfill_limit).await {
                Ok(events) => {
                    let count = events.len();
                    self.buffer.lock().extend(events);
                    info!(pair = %pair, count, "Backfilled liquidations");
                }
                Err(e) => warn!(pair = %pair, error = %e, "Backfill failed, skipping"),
            }
        }
    }

    async fn flush_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush().await,
                _ = shutdown.wait() => return,
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup().await,
                _ = shutdown.wait() => return,
            }
        }
    }
}
