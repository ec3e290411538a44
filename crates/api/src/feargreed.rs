//! Crypto Fear & Greed index (alternative.me).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::source::{MetricSource, Snapshot};

const DEFAULT_API: &str = "https://api.alternative.me/fng/?limit=1";
const LINK: &str = "https://alternative.me/crypto/fear-and-greed-index/";
pub const METRIC: &str = "fear_greed_index";

#[derive(Debug, Deserialize)]
struct FngResponse {
    data: Vec<FngEntry>,
}

#[derive(Debug, Deserialize)]
struct FngEntry {
    value: String,
}

#[derive(Debug, Clone)]
pub struct FearGreedSource {
    client: Client,
    url: String,
}

impl FearGreedSource {
    pub fn new() -> Result<Self> {
        Self::with_url(DEFAULT_API)
    }

    pub fn with_url(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("build fear & greed http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn fetch_index(&self) -> Result<f64> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("fear & greed request")?
            .error_for_status()?
            .text()
            .await?;
        parse_index(&body)
    }
}

fn parse_index(body: &str) -> Result<f64> {
    let resp: FngResponse = serde_json::from_str(body).context("decode fear & greed")?;
    let entry = resp.data.first().ok_or_else(|| anyhow!("no fear & greed data"))?;
    entry
        .value
        .trim()
        .parse()
        .with_context(|| format!("parse fear & greed value {:?}", entry.value))
}

/// Sentiment bucket for an index value (0-100).
pub fn classify_fear_greed(v: f64) -> &'static str {
    match v {
        v if v <= 25.0 => "😱 Extreme Fear",
        v if v <= 45.0 => "😰 Fear",
        v if v <= 55.0 => "😐 Neutral",
        v if v <= 75.0 => "😀 Greed",
        _ => "🤑 Extreme Greed",
    }
}

fn render_digest(value: f64, date: &str) -> String {
    format!(
        "📊 <b>CRYPTO FEAR &amp; GREED INDEX</b> {date}\n\nIndex: {value:.0} / 100\nSentiment: {}\n\n🔗 {LINK}",
        classify_fear_greed(value)
    )
}

#[async_trait]
impl MetricSource for FearGreedSource {
    fn name(&self) -> &str {
        "feargreed"
    }

    fn category(&self) -> &str {
        "General"
    }

    fn reference_link(&self) -> &str {
        LINK
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        let value = self.fetch_index().await?;
        Ok(Snapshot::new(self.name(), self.category()).with_metric(METRIC, value, "Alternative.me"))
    }

    async fn fetch_digest(&self) -> Result<String> {
        let value = self.fetch_index().await?;
        Ok(render_digest(value, &Utc::now().format("%Y-%m-%d").to_string()))
    }
}
