//! Dedup key formats. The recipient is always its own `:`-delimited segment.

use monitor_store::RecipientId;

pub fn absolute(r: RecipientId, source: &str, metric: &str, direction: &str, threshold: f64) -> String {
    format!("{}:{}:{}:{}:{:.0}", r, source, metric, direction, threshold)
}

pub fn percentage(r: RecipientId, source: &str, metric: &str, direction: &str) -> String {
    format!("{}:{}:{}:{}", r, source, metric, direction)
}

pub fn maxpain(r: RecipientId, coin: &str, side: &str, interval: &str) -> String {
    format!("maxpain:{}:{}:{}:{}", r, coin, side, interval)
}

pub fn opportunity(source: &str, r: RecipientId, opportunity_id: &str) -> String {
    format!("{}:{}:{}", source, r, opportunity_id)
}

pub fn price_target(source: &str, r: RecipientId, coin: &str, direction: &str, target: f64) -> String {
    format!("{}:{}:{}:{}:{:.2}", source, r, coin, direction, target)
}

pub fn digest(date: &str, r: RecipientId, source: &str) -> String {
    format!("digest:{}:{}:{}", date, r, source)
}
