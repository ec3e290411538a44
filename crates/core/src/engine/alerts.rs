//! Rule evaluation: per-source metric rules and the cross-cutting checks.

use anyhow::anyhow;
use monitor_api::{format_num, MetricSource, Opportunity, OpportunityFilter, Snapshot};
use monitor_store::{NotificationRecord, RecipientId, Subscription};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::Engine;
use crate::format;
use crate::keys;
use crate::maxpain::{MaxPainEntry, LINK as MAXPAIN_LINK};
use crate::rules::{
    interval_from_minutes, percentage_change, proximity_pct, window_available, MaxPainSide,
    MetricRule, PriceDirection, ThresholdDirection,
};

pub(crate) const MAXPAIN_EVENT: &str = "general_maxpain_alert";

impl Engine {
    async fn subscribers(&self, event: &str) -> Option<Vec<Subscription>> {
        match self.store.subscribers_with_rules(event).await {
            Ok(subs) if subs.is_empty() => None,
            Ok(subs) => Some(subs),
            Err(e) => {
                error!(event = %event, error = %e, "Failed to load subscribers");
                None
            }
        }
    }

    /// Edge-triggered gate: send once while the condition holds, forget it once it stops.
    /// The key is marked after the send attempt whether or not delivery succeeded.
    async fn edge_alert<F>(&self, key: String, triggered: bool, recipient: RecipientId, render: F)
    where
        F: FnOnce() -> (String, NotificationRecord) + Send,
    {
        if !triggered {
            self.dedup.clear(&key).await;
            return;
        }
        if self.dedup.already_marked(&key).await {
            self.count_deduplicated();
            return;
        }
        let (text, record) = render();
        self.deliver(recipient, &text, record).await;
        self.dedup.mark(&key).await;
    }

    /// Absolute and percentage rules for subscriptions to `<source>_metric_alert`.
    pub(super) async fn evaluate_metric_rules(
        &self,
        source: &dyn MetricSource,
        snapshot: &Snapshot,
        history: &[Arc<Snapshot>],
    ) {
        let name = source.name();
        let event = format!("{}_metric_alert", name);
        let Some(subs) = self.subscribers(&event).await else {
            return;
        };
        let link = source.reference_link();

        for sub in subs {
            let r = sub.recipient;
            match MetricRule::from_rule(&sub.rule) {
                MetricRule::Absolute { direction, threshold } => {
                    for (metric, &value) in &snapshot.metrics {
                        let key = keys::absolute(r, name, metric, direction.as_str(), threshold);
                        self.edge_alert(key, direction.triggered(value, threshold), r, || {
                            let text = format::value_alert(
                                name,
                                metric,
                                value,
                                threshold,
                                direction == ThresholdDirection::Higher,
                                link,
                            );
                            let summary = format!(
                                "{} {} {} (current: {})",
                                metric,
                                direction.as_str(),
                                format_num(threshold),
                                format_num(value)
                            );
                            (text, NotificationRecord::new(r, "value", &event, summary))
                        })
                        .await;
                    }
                }
                rule @ MetricRule::Percentage { increase, window, threshold } => {
                    let Some(w) = window_available(window, history.len()) else {
                        continue;
                    };
                    let past = &history[history.len() - 1 - w];
                    let label = rule.direction_label();

                    for (metric, &curr) in &snapshot.metrics {
                        let Some(prev) = past.metric(metric) else {
                            continue;
                        };
                        let Some(change) = percentage_change(prev, curr, increase) else {
                            continue;
                        };
                        let key = keys::percentage(r, name, metric, label);
                        self.edge_alert(key, change >= threshold, r, || {
                            let text = format::metric_change_alert(
                                name, metric, prev, curr, change, window, increase, link,
                            );
                            let summary = format!(
                                "{} {} {:.1}% over {} poll(s) (prev: {}, curr: {})",
                                metric,
                                label,
                                change * 100.0,
                                window,
                                format_num(prev),
                                format_num(curr)
                            );
                            (text, NotificationRecord::new(r, "metric", &event, summary))
                        })
                        .await;
                    }
                }
            }
        }
    }

    /// Price proximity to the max-pain level a subscription watches.
    pub(super) async fn check_maxpain(&self) {
        let Some(aggregator) = self.maxpain.as_ref() else {
            return;
        };
        let Some(subs) = self.subscribers(MAXPAIN_EVENT).await else {
            return;
        };

        // Computed at most once per (coin, interval) per cycle
        let mut entries: HashMap<(String, &'static str), Option<MaxPainEntry>> = HashMap::new();

        for sub in subs {
            let r = sub.recipient;
            let coin = sub.rule.coin.trim().to_uppercase();
            if coin.is_empty() {
                continue;
            }
            let Some(side) = MaxPainSide::parse(&sub.rule.direction) else {
                continue;
            };
            let interval = interval_from_minutes(sub.rule.window);

            let slot = (coin.clone(), interval);
            if !entries.contains_key(&slot) {
                let computed = match aggregator.compute(&coin, interval).await {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(coin = %coin, interval, error = %e, "Max-pain computation failed");
                        None
                    }
                };
                entries.insert(slot.clone(), computed);
            }
            let Some(entry) = entries.get(&slot).cloned().flatten() else {
                continue;
            };
            if entry.price <= 0.0 {
                continue;
            }
            let level = match side {
                MaxPainSide::Long => entry.long_level,
                MaxPainSide::Short => entry.short_level,
            };
            if level <= 0.0 {
                continue;
            }

            let distance = proximity_pct(entry.price, level);
            let limit = if sub.rule.threshold_value > 0.0 {
                sub.rule.threshold_value
            } else {
                self.default_proximity_pct
            };
            let key = keys::maxpain(r, &coin, side.as_str(), interval);

            self.edge_alert(key, distance <= limit, r, || {
                let link = format!("{}?type={}", MAXPAIN_LINK, interval);
                let text = format::maxpain_alert(&coin, side.as_str(), interval, entry.price, level, distance, &link);
                let summary = format!(
                    "{} {} within {:.1}% of max pain {} (interval: {})",
                    coin,
                    side.as_str(),
                    distance,
                    format_num(level),
                    interval
                );
                (text, NotificationRecord::new(r, "maxpain", MAXPAIN_EVENT, summary))
            })
            .await;
        }
    }

    /// New opportunities from every source that exposes an opportunity feed.
    pub(super) async fn check_opportunities(&self) {
        for source in self.source_list() {
            let Some(feed) = source.as_opportunity_feed() else {
                continue;
            };
            let name = source.name();
            let event = format!("general_{}_alert", name);
            let Some(subs) = self.subscribers(&event).await else {
                continue;
            };

            for sub in subs {
                let r = sub.recipient;
                let filter = opportunity_filter(&sub);
                let mut fresh: Vec<(String, Opportunity)> = Vec::new();
                for opp in feed.opportunities(&filter) {
                    let key = keys::opportunity(name, r, &opp.id);
                    if self.dedup.already_marked(&key).await {
                        self.count_deduplicated();
                        continue;
                    }
                    fresh.push((key, opp));
                }
                if fresh.is_empty() {
                    continue;
                }

                let opps: Vec<Opportunity> = fresh.iter().map(|(_, o)| o.clone()).collect();
                let text = format::opportunity_alert(name, &opps);
                let names: Vec<&str> = opps.iter().map(|o| o.name.as_str()).collect();
                let summary = format!("{} new opportunities: {}", opps.len(), names.join(", "));
                self.deliver(r, &text, NotificationRecord::new(r, name, &event, summary))
                    .await;

                // Opportunities are announced once, delivered or not
                for (key, _) in fresh {
                    self.dedup.mark(&key).await;
                }
            }
        }
    }

    /// Spot price targets for every source that exposes a price feed.
    pub(super) async fn check_price_targets(&self) {
        for source in self.source_list() {
            if source.as_price_feed().is_none() {
                continue;
            }
            let name = source.name().to_string();
            let event = format!("general_{}_price_alert", name);
            let Some(subs) = self.subscribers(&event).await else {
                continue;
            };

            let mut prices: HashMap<String, Option<f64>> = HashMap::new();
            for sub in subs {
                let r = sub.recipient;
                let target = sub.rule.threshold_value;
                if target <= 0.0 {
                    continue;
                }
                let Some(direction) = PriceDirection::parse(&sub.rule.direction) else {
                    continue;
                };
                let coin = match sub.rule.coin.trim() {
                    "" => "BTC".to_string(),
                    c => c.to_uppercase(),
                };

                if !prices.contains_key(&coin) {
                    let feed_source = Arc::clone(&source);
                    let symbol = coin.clone();
                    let fetched = self
                        .bounded(async move {
                            match feed_source.as_price_feed() {
                                Some(feed) => feed.fetch_price(&symbol).await,
                                None => Err(anyhow!("price feed unavailable")),
                            }
                        })
                        .await;
                    let price = match fetched {
                        Ok(p) => Some(p),
                        Err(e) => {
                            warn!(source = %name, coin = %coin, error = %e, "Price fetch failed");
                            None
                        }
                    };
                    prices.insert(coin.clone(), price);
                }
                let Some(price) = prices.get(&coin).copied().flatten() else {
                    continue;
                };
                debug!(source = %name, coin = %coin, price, target, "Price target check");

                let key = keys::price_target(&name, r, &coin, direction.as_str(), target);
                let link = source.reference_link();
                self.edge_alert(key, direction.reached(price, target), r, || {
                    let text = format::price_target_alert(
                        &coin,
                        price,
                        target,
                        direction == PriceDirection::Increase,
                        link,
                    );
                    let summary = format!(
                        "{}/USDT {} to {} (current: {})",
                        coin,
                        direction.as_str(),
                        format_num(target),
                        format_num(price)
                    );
                    (text, NotificationRecord::new(r, "price", &event, summary))
                })
                .await;
            }
        }
    }
}

/// Opportunity filter from a subscription's rule fields.
pub(crate) fn opportunity_filter(sub: &Subscription) -> OpportunityFilter {
    let rule = &sub.rule;
    let min_apr = if rule.threshold_value > 0.0 { rule.threshold_value } else { 10.0 };
    let min_tvl = if rule.threshold_pct > 0.0 {
        rule.threshold_pct * 1_000_000.0
    } else {
        1_000_000.0
    };
    let tag = match rule.coin.trim() {
        "" => "ALL".to_string(),
        c => c.to_uppercase(),
    };
    let token = match rule.direction.trim() {
        "" => "any".to_string(),
        d => d.to_lowercase(),
    };
    OpportunityFilter {
        min_apr,
        min_tvl,
        tag,
        token,
    }
}
