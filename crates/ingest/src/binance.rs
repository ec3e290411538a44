//! Binance USD-M futures force-order feed: stream parsing and REST backfill.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use monitor_store::{LiquidationEvent, LiquidationSide};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const EXCHANGE: &str = "binance";
pub const DEFAULT_WS_BASE: &str = "wss://fstream.binance.com/ws";
pub const DEFAULT_REST_BASE: &str = "https://fapi.binance.com";

const QUOTE_SUFFIX: &str = "USDT";

/// `<symbol>@forceOrder` stream message.
#[derive(Debug, Deserialize)]
struct ForceOrderMessage {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "o")]
    order: ForceOrder,
}

#[derive(Debug, Deserialize)]
struct ForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q", default)]
    quantity: String,
    #[serde(rename = "p", default)]
    price: String,
    #[serde(rename = "ap", default)]
    avg_price: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "z", default)]
    filled_qty: String,
    #[serde(rename = "T", default)]
    trade_time: i64,
}

/// Historical force order from `/fapi/v1/allForceOrders`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestForceOrder {
    symbol: String,
    side: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    average_price: String,
    #[serde(default)]
    orig_qty: String,
    #[serde(default)]
    executed_qty: String,
    status: String,
    time: i64,
}

/// Build the combined stream URL, e.g. `.../ws/btcusdt@forceOrder/ethusdt@forceOrder`.
pub fn stream_url(ws_base: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@forceOrder", s.to_lowercase()))
        .collect();
    format!("{}/{}", ws_base.trim_end_matches('/'), streams.join("/"))
}

/// Parse one stream message. Anything that is not a filled force order is dropped.
pub fn parse_force_order(text: &str) -> Option<LiquidationEvent> {
    let msg: ForceOrderMessage = serde_json::from_str(text).ok()?;
    if msg.event != "forceOrder" {
        return None;
    }
    let o = msg.order;
    build_event(
        &o.symbol,
        &o.side,
        &o.status,
        (&o.avg_price, &o.price),
        (&o.filled_qty, &o.quantity),
        o.trade_time,
    )
}

fn build_event(
    symbol: &str,
    side: &str,
    status: &str,
    (avg_price, price): (&str, &str),
    (filled_qty, qty): (&str, &str),
    time_ms: i64,
) -> Option<LiquidationEvent> {
    if status != "FILLED" {
        return None;
    }
    let side = LiquidationSide::from_order_side(side)?;

    let price = positive_or(parse_decimal(avg_price), parse_decimal(price));
    let quantity = positive_or(parse_decimal(filled_qty), parse_decimal(qty));
    if price <= 0.0 || quantity <= 0.0 {
        return None;
    }

    let event_time = DateTime::<Utc>::from_timestamp_millis(time_ms).unwrap_or_else(Utc::now);
    Some(LiquidationEvent::new(
        base_symbol(symbol),
        side,
        price,
        quantity,
        EXCHANGE,
        event_time,
    ))
}

/// "btcusdt" -> "BTC"
pub fn base_symbol(pair: &str) -> String {
    let upper = pair.to_uppercase();
    upper
        .strip_suffix(QUOTE_SUFFIX)
        .map(str::to_string)
        .unwrap_or(upper)
}

fn parse_decimal(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

fn positive_or(primary: f64, fallback: f64) -> f64 {
    if primary > 0.0 {
        primary
    } else {
        fallback
    }
}

/// REST client used to backfill recent liquidations on startup.
#[derive(Debug, Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
}

impl BinanceFuturesClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build binance futures http client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Most recent filled force orders for a pair (e.g. "btcusdt").
    pub async fn recent_force_orders(&self, pair: &str, limit: u32) -> Result<Vec<LiquidationEvent>> {
        let url = format!(
            "{}/fapi/v1/allForceOrders?symbol={}&limit={}",
            self.base_url.trim_end_matches('/'),
            pair.to_uppercase(),
            limit
        );
        let orders: Vec<RestForceOrder> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("force orders request for {}", pair))?
            .json()
            .await?;

        let events: Vec<LiquidationEvent> = orders
            .iter()
            .filter_map(|o| {
                build_event(
                    &o.symbol,
                    &o.side,
                    &o.status,
                    (&o.average_price, &o.price),
                    (&o.executed_qty, &o.orig_qty),
                    o.time,
                )
            })
            .collect();
        debug!(pair = %pair, fetched = orders.len(), kept = events.len(), "Backfill fetched");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(side: &str, status: &str, ap: &str, z: &str) -> String {
        format!(
            r#"{{"e":"forceOrder","E":1700000000000,"o":{{"s":"BTCUSDT","S":"{side}","o":"LIMIT","q":"0.5","p":"41000","ap":"{ap}","X":"{status}","z":"{z}","T":1700000000000}}}}"#
        )
    }

    #[test]
    fn test_parse_filled_sell_is_long() {
        let ev = parse_force_order(&message("SELL", "FILLED", "40000", "0.25")).unwrap();
        assert_eq!(ev.symbol, "BTC");
        assert_eq!(ev.side, LiquidationSide::Long);
        assert_eq!(ev.price, 40000.0);
        assert_eq!(ev.quantity, 0.25);
        assert_eq!(ev.usd_value, 10000.0);
        assert_eq!(ev.exchange, "binance");
        assert_eq!(ev.event_time.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_falls_back_to_order_price_and_qty() {
        let ev = parse_force_order(&message("BUY", "FILLED", "0", "0")).unwrap();
        assert_eq!(ev.side, LiquidationSide::Short);
        assert_eq!(ev.price, 41000.0);
        assert_eq!(ev.quantity, 0.5);
    }

    #[test]
    fn test_parse_drops_unusable_messages() {
        assert!(parse_force_order("not json").is_none());
        assert!(parse_force_order(&message("SELL", "NEW", "40000", "0.25")).is_none());
        assert!(parse_force_order(&message("HOLD", "FILLED", "40000", "0.25")).is_none());
        assert!(parse_force_order(r#"{"e":"aggTrade","o":{"s":"BTCUSDT","S":"SELL","X":"FILLED"}}"#).is_none());
    }

    #[test]
    fn test_stream_url_and_symbol() {
        let url = stream_url(DEFAULT_WS_BASE, &["btcusdt".into(), "ETHUSDT".into()]);
        assert_eq!(url, "wss://fstream.binance.com/ws/btcusdt@forceOrder/ethusdt@forceOrder");
        assert_eq!(base_symbol("ethusdt"), "ETH");
        assert_eq!(base_symbol("BTCBUSD"), "BTCBUSD");
    }
}
