//! Scheduled daily digests.

use monitor_store::NotificationRecord;
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::Engine;
use crate::keys;

impl Engine {
    /// Send each source's digest to recipients whose digest hour is `hour`.
    /// At most one digest per recipient, source and `date`.
    #[instrument(skip(self))]
    pub async fn send_due_digests(&self, hour: u32, date: &str) {
        for source in self.source_list() {
            let name = source.name().to_string();
            let event = format!("{}_daily_report", name);
            let recipients = match self.store.digest_subscribers(&event, hour).await {
                Ok(r) if r.is_empty() => continue,
                Ok(r) => r,
                Err(e) => {
                    error!(event = %event, hour, error = %e, "Failed to load digest subscribers");
                    continue;
                }
            };

            let digest_source = Arc::clone(&source);
            let text = match self
                .bounded(async move { digest_source.fetch_digest().await })
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    error!(source = %name, error = %e, "Digest generation failed");
                    continue;
                }
            };

            let mut sent = 0usize;
            for r in recipients {
                let key = keys::digest(date, r, &name);
                if self.dedup.already_marked(&key).await {
                    self.count_deduplicated();
                    continue;
                }
                let summary = format!("Daily {} digest (hour {})", name, hour);
                let record = NotificationRecord::new(r, "daily_report", &event, summary);
                if self.deliver(r, &text, record).await {
                    self.dedup.mark(&key).await;
                    sent += 1;
                }
            }
            if sent > 0 {
                info!(source = %name, hour, recipients = sent, "Sent daily digests");
            }
        }
    }
}
