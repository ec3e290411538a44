//! Telegram Bot API notifier.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::notifier::Notifier;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum TelegramError {
    /// Transport failure. The URL is stripped since it embeds the bot token.
    #[error("telegram request failed: {0}")]
    Http(reqwest::Error),
    #[error("telegram API error {status}: {description}")]
    Api { status: u16, description: String },
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    description: String,
}

/// Sends HTML-formatted messages through `sendMessage`.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Result<Self, TelegramError> {
        Self::with_base_url(DEFAULT_API_BASE, token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, TelegramError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url.trim_end_matches('/'), self.token)
    }

    #[instrument(skip(self, text))]
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let body = SendMessageRequest {
            chat_id,
            text,
            parse_mode: "HTML",
        };
        let resp = self.client.post(self.endpoint()).json(&body).send().await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let raw = resp.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &raw));
        }
        debug!(chat_id, "Telegram message sent");
        Ok(())
    }
}

fn api_error(status: u16, raw: &str) -> TelegramError {
    let parsed: ErrorResponse = serde_json::from_str(raw).unwrap_or_default();
    TelegramError::Api {
        status,
        description: parsed.description,
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, recipient: i64, text: &str) -> anyhow::Result<()> {
        Ok(self.send_message(recipient, text).await?)
    }
}
