//! Outbound notification delivery.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Delivers a rendered message to one recipient.
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    async fn send(&self, recipient: i64, text: &str) -> Result<()>;
}
