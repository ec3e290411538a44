//! Binance spot prices: metric source and on-demand price feed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::format::add_commas;
use crate::source::{MetricSource, PriceFeed, Snapshot};

const DEFAULT_API_BASE: &str = "https://api.binance.com";
const LINK: &str = "https://www.binance.com/en/trade/";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

/// Spot ticker source. Publishes `<symbol>_price` for each tracked base asset.
#[derive(Debug, Clone)]
pub struct BinanceSpotSource {
    client: Client,
    base_url: String,
    symbols: Vec<String>,
}

impl BinanceSpotSource {
    pub fn new(symbols: Vec<String>) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_BASE, symbols)
    }

    pub fn with_base_url(base_url: impl Into<String>, symbols: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build binance http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            symbols: symbols.into_iter().map(|s| s.to_uppercase()).collect(),
        })
    }

    async fn fetch_prices(&self) -> Result<Vec<(String, f64)>> {
        let mut prices = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            prices.push((symbol.clone(), self.fetch_price(symbol).await?));
        }
        Ok(prices)
    }
}

fn metric_name(symbol: &str) -> String {
    format!("{}_price", symbol.to_lowercase())
}

fn parse_ticker(body: &str) -> Result<f64> {
    let ticker: TickerPrice = serde_json::from_str(body).context("decode binance ticker")?;
    ticker
        .price
        .parse()
        .with_context(|| format!("parse binance price {:?}", ticker.price))
}

#[async_trait]
impl PriceFeed for BinanceSpotSource {
    async fn fetch_price(&self, symbol: &str) -> Result<f64> {
        let pair = format!("{}USDT", symbol.to_uppercase());
        let url = format!("{}/api/v3/ticker/price", self.base_url.trim_end_matches('/'));
        let body = self
            .client
            .get(&url)
            .query(&[("symbol", pair.as_str())])
            .send()
            .await
            .context("binance ticker request")?
            .error_for_status()?
            .text()
            .await?;
        let price = parse_ticker(&body)?;
        debug!(pair = %pair, price, "Fetched spot price");
        Ok(price)
    }
}

#[async_trait]
impl MetricSource for BinanceSpotSource {
    fn name(&self) -> &str {
        "binance"
    }

    fn category(&self) -> &str {
        "General"
    }

    fn reference_link(&self) -> &str {
        LINK
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let snapshot = self
            .fetch_prices()
            .await?
            .into_iter()
            .fold(Snapshot::new(self.name(), self.category()), |snap, (symbol, price)| {
                snap.with_metric(metric_name(&symbol), price, "Binance")
            });
        Ok(snapshot)
    }

    async fn fetch_digest(&self) -> Result<String> {
        let prices = self.fetch_prices().await?;
        let mut text = format!("📊 <b>BINANCE SPOT PRICES</b> {}\n\n", Utc::now().format("%Y-%m-%d"));
        for (symbol, price) in &prices {
            text.push_str(&format!("{}/USDT: ${}\n", symbol, add_commas(*price)));
        }
        text.push_str(&format!("\n🔗 {}", LINK));
        Ok(text)
    }

    fn as_price_feed(&self) -> Option<&dyn PriceFeed> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticker() {
        assert_eq!(parse_ticker(r#"{"symbol":"BTCUSDT","price":"43250.12000000"}"#).unwrap(), 43250.12);
        assert!(parse_ticker(r#"{"code":-1121,"msg":"Invalid symbol."}"#).is_err());
    }

    #[test]
    fn test_capabilities() {
        let source = BinanceSpotSource::new(vec!["btc".into()]).unwrap();
        assert!(source.as_price_feed().is_some());
        assert!(source.as_opportunity_feed().is_none());
        assert_eq!(metric_name("BTC"), "btc_price");
        assert_eq!(source.symbols, vec!["BTC".to_string()]);
    }
}
