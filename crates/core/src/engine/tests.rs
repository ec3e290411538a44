use super::*;
use crate::dedup::MemoryDedupBackend;
use crate::maxpain::MaxPainAggregator;
use crate::config::MaxPainConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use monitor_api::{Opportunity, OpportunityFeed, OpportunityFilter, PriceFeed};
use monitor_ingest::shutdown_channel;
use monitor_store::{
    LiquidationEvent, LiquidationSide, LiquidationStore, SqliteStore, Subscription,
    SubscriptionRule,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;

#[derive(Debug, Default)]
struct FakeSource {
    name: String,
    category: String,
    metrics: Mutex<BTreeMap<String, f64>>,
    fail: AtomicBool,
    delay: Option<Duration>,
    digest_calls: AtomicU64,
    opportunities: Option<Mutex<Vec<Opportunity>>>,
    price: Option<Mutex<f64>>,
}

impl FakeSource {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            category: "General".to_string(),
            ..Default::default()
        }
    }

    fn set(&self, metric: &str, value: f64) {
        self.metrics.lock().insert(metric.to_string(), value);
    }
}

#[async_trait]
impl MetricSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn reference_link(&self) -> &str {
        "https://example.com"
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("upstream 503"));
        }
        let snapshot = self
            .metrics
            .lock()
            .iter()
            .fold(Snapshot::new(&self.name, &self.category), |s, (k, v)| {
                s.with_metric(k.clone(), *v, "fake")
            });
        Ok(snapshot)
    }

    async fn fetch_digest(&self) -> Result<String> {
        self.digest_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} digest", self.name))
    }

    fn as_opportunity_feed(&self) -> Option<&dyn OpportunityFeed> {
        self.opportunities.as_ref().map(|_| self as &dyn OpportunityFeed)
    }

    fn as_price_feed(&self) -> Option<&dyn PriceFeed> {
        self.price.as_ref().map(|_| self as &dyn PriceFeed)
    }
}

impl OpportunityFeed for FakeSource {
    fn opportunities(&self, filter: &OpportunityFilter) -> Vec<Opportunity> {
        self.opportunities
            .as_ref()
            .map(|o| o.lock().iter().filter(|o| filter.matches(o)).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PriceFeed for FakeSource {
    async fn fetch_price(&self, _symbol: &str) -> Result<f64> {
        self.price
            .as_ref()
            .map(|p| *p.lock())
            .ok_or_else(|| anyhow!("no price"))
    }
}

#[derive(Debug, Default)]
struct FakeStore {
    subs: Mutex<Vec<Subscription>>,
    log: Mutex<Vec<NotificationRecord>>,
    fail_lookup: AtomicBool,
}

impl FakeStore {
    fn subscribe(&self, recipient: RecipientId, event: &str, rule: SubscriptionRule) {
        let mut subs = self.subs.lock();
        let id = subs.len() as i64 + 1;
        subs.push(Subscription {
            id,
            recipient,
            event_name: event.to_string(),
            rule,
        });
    }
}

#[async_trait]
impl SubscriptionStore for FakeStore {
    async fn subscribers_with_rules(&self, event_name: &str) -> Result<Vec<Subscription>> {
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self
            .subs
            .lock()
            .iter()
            .filter(|s| s.event_name == event_name)
            .cloned()
            .collect())
    }

    async fn digest_subscribers(&self, event_name: &str, hour: u32) -> Result<Vec<RecipientId>> {
        Ok(self
            .subs
            .lock()
            .iter()
            .filter(|s| s.event_name == event_name && s.rule.digest_hour == hour)
            .map(|s| s.recipient)
            .collect())
    }

    async fn log_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.log.lock().push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeNotifier {
    sent: Mutex<Vec<(RecipientId, String)>>,
    failing: Mutex<HashSet<RecipientId>>,
}

impl FakeNotifier {
    fn count(&self) -> usize {
        self.sent.lock().len()
    }

    fn count_for(&self, recipient: RecipientId) -> usize {
        self.sent.lock().iter().filter(|(r, _)| *r == recipient).count()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, recipient: i64, text: &str) -> Result<()> {
        if self.failing.lock().contains(&recipient) {
            return Err(anyhow!("chat not found"));
        }
        self.sent.lock().push((recipient, text.to_string()));
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    store: Arc<FakeStore>,
    notifier: Arc<FakeNotifier>,
    backend: Arc<MemoryDedupBackend>,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(FakeStore::default());
    let notifier = Arc::new(FakeNotifier::default());
    let backend = Arc::new(MemoryDedupBackend::new());
    let engine = Engine::new(
        store.clone(),
        notifier.clone(),
        Deduplicator::new(backend.clone()),
        config,
    );
    Harness {
        engine,
        store,
        notifier,
        backend,
    }
}

fn rule(direction: &str) -> SubscriptionRule {
    SubscriptionRule {
        direction: direction.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_drop_alert_fires_once_per_crossing() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(1, "binance_metric_alert", rule("drop"));

    for (value, expected) in [(100.0, 0), (89.0, 1), (80.0, 1), (80.0, 1), (100.0, 1), (89.0, 2)] {
        source.set("btc_price", value);
        h.engine.poll_cycle().await;
        assert_eq!(h.notifier.count(), expected, "after value {}", value);
    }
    // 89 -> 80 was another 10%+ drop while the key was still set
    assert_eq!(h.engine.stats().alerts_deduplicated, 1);
    assert_eq!(h.engine.stats().polls_ok, 6);
}

#[tokio::test]
async fn test_increase_alert() {
    let h = harness();
    let source = Arc::new(FakeSource::new("feargreed"));
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "feargreed_metric_alert",
        SubscriptionRule {
            threshold_pct: 20.0,
            ..rule("increase")
        },
    );

    source.set("fear_greed_index", 40.0);
    h.engine.poll_cycle().await;
    source.set("fear_greed_index", 47.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 0);
    source.set("fear_greed_index", 60.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 1);
    assert!(h.notifier.sent.lock()[0].1.contains("INCREASE ALERT"));
}

#[tokio::test]
async fn test_percentage_needs_full_window() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "binance_metric_alert",
        SubscriptionRule {
            window: 3,
            ..rule("drop")
        },
    );

    for value in [100.0, 50.0, 20.0] {
        source.set("btc_price", value);
        h.engine.poll_cycle().await;
    }
    assert_eq!(h.notifier.count(), 0);

    source.set("btc_price", 10.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_metric_missing_from_older_snapshot_is_skipped() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(1, "binance_metric_alert", rule("drop"));

    source.set("btc_price", 100.0);
    h.engine.poll_cycle().await;
    source.set("eth_price", 1.0);
    source.set("btc_price", 100.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test]
async fn test_absolute_threshold_edges() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(
        7,
        "binance_metric_alert",
        SubscriptionRule {
            threshold_value: 50_000.0,
            ..rule("higher")
        },
    );

    for (value, expected) in [(49_000.0, 0), (51_000.0, 1), (51_000.0, 1), (48_000.0, 1), (52_000.0, 2)] {
        source.set("btc_price", value);
        h.engine.poll_cycle().await;
        assert_eq!(h.notifier.count(), expected, "after value {}", value);
    }

    let log = h.store.log.lock();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].alert_type, "value");
    assert_eq!(log[0].event_name, "binance_metric_alert");
}

#[tokio::test]
async fn test_dedup_outage_suppresses_alerts() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "binance_metric_alert",
        SubscriptionRule {
            threshold_value: 10.0,
            ..rule("higher")
        },
    );
    h.backend.set_available(false);

    source.set("btc_price", 100.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 0);
    assert_eq!(h.engine.stats().alerts_deduplicated, 1);
}

#[tokio::test]
async fn test_send_failure_does_not_block_other_recipients() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    for r in [1, 2, 3] {
        h.store.subscribe(
            r,
            "binance_metric_alert",
            SubscriptionRule {
                threshold_value: 10.0,
                ..rule("higher")
            },
        );
    }
    h.notifier.failing.lock().insert(2);

    source.set("btc_price", 100.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count_for(1), 1);
    assert_eq!(h.notifier.count_for(3), 1);
    let stats = h.engine.stats();
    assert_eq!(stats.alerts_sent, 2);
    assert_eq!(stats.alerts_failed, 1);

    // Marked despite the failure: no retry while the condition holds
    h.notifier.failing.lock().clear();
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count_for(2), 0);
}

#[tokio::test]
async fn test_failed_and_slow_sources_are_skipped() {
    let h = harness_with(EngineConfig {
        fetch_timeout_secs: 1,
        ..Default::default()
    });
    let slow = Arc::new(FakeSource {
        delay: Some(Duration::from_secs(5)),
        ..FakeSource::new("slow")
    });
    let broken = Arc::new(FakeSource::new("broken"));
    broken.fail.store(true, Ordering::SeqCst);
    let healthy = Arc::new(FakeSource::new("healthy"));
    healthy.set("tvl", 1.0);
    h.engine.register(slow);
    h.engine.register(broken);
    h.engine.register(healthy);

    h.engine.poll_cycle().await;

    let stats = h.engine.stats();
    assert_eq!(stats.polls_ok, 1);
    assert_eq!(stats.polls_failed, 2);
    assert_eq!(h.engine.history_len("healthy"), 1);
    assert_eq!(h.engine.history_len("slow"), 0);
    assert!(h.engine.latest_snapshot("broken").is_none());
}

#[tokio::test]
async fn test_store_failure_skips_evaluation() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "binance_metric_alert",
        SubscriptionRule {
            threshold_value: 10.0,
            ..rule("higher")
        },
    );
    h.store.fail_lookup.store(true, Ordering::SeqCst);

    source.set("btc_price", 100.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 0);
    assert_eq!(h.engine.history_len("binance"), 1);
}

#[tokio::test]
async fn test_digest_once_per_day() {
    let h = harness();
    let source = Arc::new(FakeSource::new("feargreed"));
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "feargreed_daily_report",
        SubscriptionRule {
            digest_hour: 9,
            ..Default::default()
        },
    );
    h.store.subscribe(
        2,
        "feargreed_daily_report",
        SubscriptionRule {
            digest_hour: 9,
            ..Default::default()
        },
    );
    h.store.subscribe(3, "feargreed_daily_report", SubscriptionRule::default());
    h.notifier.failing.lock().insert(2);

    h.engine.send_due_digests(9, "2024-01-02").await;
    assert_eq!(h.notifier.count_for(1), 1);
    assert_eq!(h.notifier.count_for(3), 0);

    // Failed delivery is not marked, so a second check retries it
    h.notifier.failing.lock().clear();
    h.engine.send_due_digests(9, "2024-01-02").await;
    assert_eq!(h.notifier.count_for(1), 1);
    assert_eq!(h.notifier.count_for(2), 1);

    h.engine.send_due_digests(9, "2024-01-03").await;
    assert_eq!(h.notifier.count_for(1), 2);
    assert_eq!(source.digest_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unsubscribe_resets_recipient_dedup() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    h.engine.register(source.clone());
    h.store.subscribe(
        5,
        "binance_metric_alert",
        SubscriptionRule {
            threshold_value: 10.0,
            ..rule("higher")
        },
    );
    source.set("btc_price", 100.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 1);

    h.engine.dedup().clear_recipient(5).await;
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 2);
}

fn opportunity(id: &str, apr: f64) -> Opportunity {
    Opportunity {
        id: id.to_string(),
        name: format!("Vault {}", id),
        tag: "LEND".to_string(),
        tvl: 5_000_000.0,
        apr,
        chain: "Ethereum".to_string(),
        protocol: "Morpho".to_string(),
        link: String::new(),
        stablecoin: true,
    }
}

#[tokio::test]
async fn test_opportunities_alerted_once_per_id() {
    let h = harness();
    let source = Arc::new(FakeSource {
        opportunities: Some(Mutex::new(vec![opportunity("a", 15.0), opportunity("b", 4.0)])),
        ..FakeSource::new("merkl")
    });
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "general_merkl_alert",
        SubscriptionRule {
            threshold_pct: 1.0,
            threshold_value: 0.0,
            direction: String::new(),
            ..Default::default()
        },
    );

    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 1);
    assert!(h.notifier.sent.lock()[0].1.contains("Vault a"));
    assert!(!h.notifier.sent.lock()[0].1.contains("Vault b"));

    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 1);

    if let Some(opps) = &source.opportunities {
        opps.lock().push(opportunity("c", 20.0));
    }
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 2);
    let last = h.notifier.sent.lock()[1].1.clone();
    assert!(last.contains("Vault c"));
    assert!(!last.contains("Vault a"));
}

#[tokio::test]
async fn test_price_target_edges() {
    let h = harness();
    let source = Arc::new(FakeSource {
        price: Some(Mutex::new(2_900.0)),
        ..FakeSource::new("binance")
    });
    h.engine.register(source.clone());
    h.store.subscribe(
        1,
        "general_binance_price_alert",
        SubscriptionRule {
            coin: "eth".to_string(),
            threshold_value: 3_000.0,
            ..rule("increase")
        },
    );

    let set_price = |p: f64| {
        if let Some(price) = &source.price {
            *price.lock() = p;
        }
    };

    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 0);

    set_price(3_000.0);
    h.engine.poll_cycle().await;
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 1);
    assert!(h.notifier.sent.lock()[0].1.contains("ETH/USDT PRICE"));

    set_price(2_950.0);
    h.engine.poll_cycle().await;
    set_price(3_100.0);
    h.engine.poll_cycle().await;
    assert_eq!(h.notifier.count(), 2);
    assert!(h.backend.len() >= 1);
}

#[tokio::test]
async fn test_maxpain_proximity_alert() {
    let liquidations = Arc::new(SqliteStore::open_in_memory().unwrap());
    let now = chrono::Utc::now();
    liquidations
        .insert_liquidation_events(&[
            LiquidationEvent::new("BTC", LiquidationSide::Long, 60_000.0, 5.0, "binance", now),
            LiquidationEvent::new("BTC", LiquidationSide::Short, 65_000.0, 1.0, "binance", now),
            LiquidationEvent::new("BTC", LiquidationSide::Short, 60_300.0, 0.01, "binance", now),
        ])
        .await
        .unwrap();
    let aggregator = Arc::new(MaxPainAggregator::new(liquidations, MaxPainConfig::default()));

    let h = harness();
    let engine = h.engine.with_maxpain(aggregator.clone());
    h.store.subscribe(
        1,
        "general_maxpain_alert",
        SubscriptionRule {
            coin: "btc".to_string(),
            window: 1440,
            threshold_value: 0.0,
            ..rule("long")
        },
    );
    h.store.subscribe(
        2,
        "general_maxpain_alert",
        SubscriptionRule {
            coin: "BTC".to_string(),
            window: 1440,
            ..rule("short")
        },
    );

    engine.poll_cycle().await;
    // 60300 is 0.5% from the 60000 long level, 7.8% from the 65000 short level
    assert_eq!(h.notifier.count_for(1), 1);
    assert_eq!(h.notifier.count_for(2), 0);
    assert!(h.notifier.sent.lock()[0].1.contains("BTC LONG MAX PAIN ALERT (24h)"));
    assert!(aggregator.cached("BTC", "24h").is_some());

    engine.poll_cycle().await;
    assert_eq!(h.notifier.count_for(1), 1);
}

#[tokio::test]
async fn test_registry_accessors() {
    let h = harness();
    let first = Arc::new(FakeSource::new("binance"));
    let second = Arc::new(FakeSource {
        category: "Hyperliquid".to_string(),
        ..FakeSource::new("binance")
    });
    h.engine.register(first);
    h.engine.register(second);
    h.engine.register(Arc::new(FakeSource::new("feargreed")));

    assert_eq!(h.engine.source_names(), vec!["binance", "feargreed"]);
    assert_eq!(h.engine.categories(), vec!["General", "Hyperliquid"]);

    let stats = serde_json::to_value(h.engine.stats()).unwrap();
    assert_eq!(stats["polls_ok"], 0);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = harness();
    let source = Arc::new(FakeSource::new("binance"));
    source.set("btc_price", 1.0);
    h.engine.register(source);
    let engine = Arc::new(h.engine);

    let (trigger, shutdown) = shutdown_channel();
    let handle = tokio::spawn(Arc::clone(&engine).run(shutdown));
    tokio::time::sleep(Duration::from_millis(100)).await;
    trigger.trigger();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.history_len("binance"), 1);
}

#[tokio::test]
async fn test_run_retries_failed_digest_within_the_hour() {
    let h = harness_with(EngineConfig {
        poll_interval_secs: 1,
        ..Default::default()
    });
    let source = Arc::new(FakeSource::new("feargreed"));
    source.set("fear_greed_index", 50.0);
    h.engine.register(source.clone());

    let offset = chrono::FixedOffset::east_opt(8 * 3600).unwrap();
    let hour = chrono::Utc::now().with_timezone(&offset).hour();
    h.store.subscribe(
        1,
        "feargreed_daily_report",
        SubscriptionRule {
            digest_hour: hour,
            ..Default::default()
        },
    );
    h.notifier.failing.lock().insert(1);

    let engine = Arc::new(h.engine);
    let (trigger, shutdown) = shutdown_channel();
    let handle = tokio::spawn(Arc::clone(&engine).run(shutdown));

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.notifier.failing.lock().clear();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    trigger.trigger();
    handle.await.unwrap();

    assert_eq!(h.notifier.count_for(1), 1);
    assert!(source.digest_calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(engine.stats().alerts_failed, 1);
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_cycle_finish() {
    let h = harness();
    let source = Arc::new(FakeSource {
        delay: Some(Duration::from_millis(300)),
        ..FakeSource::new("binance")
    });
    source.set("btc_price", 100.0);
    h.engine.register(source);
    h.store.subscribe(
        1,
        "binance_metric_alert",
        SubscriptionRule {
            threshold_value: 10.0,
            ..rule("higher")
        },
    );

    let engine = Arc::new(h.engine);
    let (trigger, shutdown) = shutdown_channel();
    let handle = tokio::spawn(Arc::clone(&engine).run(shutdown));
    tokio::time::sleep(Duration::from_millis(100)).await;
    trigger.trigger();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.notifier.count(), 1);
    assert_eq!(h.backend.len(), 1);
}
