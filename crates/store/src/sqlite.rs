//! SQLite-backed store.
//!
//! A single connection guarded by a mutex. Trait methods and dedup key
//! operations run their statements on the blocking pool; the plain CRUD
//! methods are synchronous and meant for startup and the API layer.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::{
    EventDefinition, LiquidationEvent, LiquidationSide, MaxPainBuckets, NotificationRecord,
    PriceBucket, RecipientId, Subscription, SubscriptionRule,
};
use crate::{LiquidationStore, SubscriptionStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    category    TEXT NOT NULL DEFAULT 'general',
    enabled     INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id    INTEGER NOT NULL,
    event_id        INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    threshold_pct   REAL NOT NULL DEFAULT 10,
    window_size     INTEGER NOT NULL DEFAULT 1,
    direction       TEXT NOT NULL DEFAULT 'drop',
    threshold_value REAL NOT NULL DEFAULT 0,
    digest_hour     INTEGER NOT NULL DEFAULT 8,
    coin            TEXT NOT NULL DEFAULT '',
    UNIQUE(recipient_id, event_id)
);

CREATE TABLE IF NOT EXISTS liquidation_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol     TEXT NOT NULL,
    side       TEXT NOT NULL,
    price      REAL NOT NULL,
    quantity   REAL NOT NULL,
    usd_value  REAL NOT NULL,
    exchange   TEXT NOT NULL,
    event_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_liquidation_symbol_time
    ON liquidation_events(symbol, event_time);

CREATE TABLE IF NOT EXISTS notifications (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id INTEGER NOT NULL,
    alert_type   TEXT NOT NULL,
    event_name   TEXT NOT NULL,
    summary      TEXT NOT NULL,
    sent_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dedup_keys (
    key        TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);
"#;

/// One row per exchange fill, so a re-delivered event (backfill overlap) is ignored.
const LIQUIDATION_NATURAL_KEY: &str = r#"
DELETE FROM liquidation_events WHERE id NOT IN (
    SELECT MIN(id) FROM liquidation_events
    GROUP BY symbol, side, price, quantity, exchange, event_time
);
CREATE UNIQUE INDEX idx_liquidation_natural_key
    ON liquidation_events(symbol, side, price, quantity, exchange, event_time);
"#;

const SUBSCRIPTION_COLUMNS: &str = "s.id, s.recipient_id, e.name, s.threshold_pct, s.window_size, \
     s.direction, s.threshold_value, s.digest_hour, s.coin";

/// SQLite implementation of the durable store and the dedup key table.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// In-memory database, used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Apply the idempotent schema.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA)?;

        let has_natural_key = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = 'idx_liquidation_natural_key'")?
            .exists([])?;
        if !has_natural_key {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(LIQUIDATION_NATURAL_KEY)?;
            tx.commit()?;
            info!("Added liquidation natural key index");
        }
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .context("sqlite task aborted")?
    }

    // Events

    /// Create the event if missing and return its id.
    pub fn ensure_event(&self, name: &str, description: &str, category: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (name, description, category) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO NOTHING",
            params![name, description, category],
        )?;
        let id = conn.query_row("SELECT id FROM events WHERE name = ?1", [name], |r| r.get(0))?;
        Ok(id)
    }

    pub fn list_events(&self) -> Result<Vec<EventDefinition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, category, enabled FROM events
             WHERE enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(EventDefinition {
                id: r.get(0)?,
                name: r.get(1)?,
                description: r.get(2)?,
                category: r.get(3)?,
                enabled: r.get::<_, i64>(4)? != 0,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Subscriptions

    /// Subscribe a recipient to an existing event, replacing the rule if already subscribed.
    pub fn subscribe(
        &self,
        recipient: RecipientId,
        event_name: &str,
        rule: &SubscriptionRule,
    ) -> Result<Subscription> {
        let conn = self.conn.lock();
        let event_id: i64 = conn
            .query_row("SELECT id FROM events WHERE name = ?1", [event_name], |r| r.get(0))
            .optional()?
            .ok_or_else(|| anyhow!("unknown event: {}", event_name))?;

        conn.execute(
            "INSERT INTO subscriptions
                (recipient_id, event_id, threshold_pct, window_size, direction,
                 threshold_value, digest_hour, coin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(recipient_id, event_id) DO UPDATE SET
                threshold_pct = excluded.threshold_pct,
                window_size = excluded.window_size,
                direction = excluded.direction,
                threshold_value = excluded.threshold_value,
                digest_hour = excluded.digest_hour,
                coin = excluded.coin",
            params![
                recipient,
                event_id,
                rule.threshold_pct,
                rule.window,
                rule.direction,
                rule.threshold_value,
                rule.digest_hour,
                rule.coin,
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM subscriptions WHERE recipient_id = ?1 AND event_id = ?2",
            params![recipient, event_id],
            |r| r.get(0),
        )?;

        Ok(Subscription {
            id,
            recipient,
            event_name: event_name.to_string(),
            rule: rule.clone(),
        })
    }

    /// Replace a subscription's rule. Returns false if it does not exist.
    pub fn update_rule(&self, subscription_id: i64, rule: &SubscriptionRule) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE subscriptions SET threshold_pct = ?2, window_size = ?3, direction = ?4,
                threshold_value = ?5, digest_hour = ?6, coin = ?7
             WHERE id = ?1",
            params![
                subscription_id,
                rule.threshold_pct,
                rule.window,
                rule.direction,
                rule.threshold_value,
                rule.digest_hour,
                rule.coin,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a subscription, returning its recipient so callers can reset dedup state.
    pub fn unsubscribe(&self, subscription_id: i64) -> Result<Option<RecipientId>> {
        let conn = self.conn.lock();
        let recipient: Option<RecipientId> = conn
            .query_row(
                "SELECT recipient_id FROM subscriptions WHERE id = ?1",
                [subscription_id],
                |r| r.get(0),
            )
            .optional()?;
        conn.execute("DELETE FROM subscriptions WHERE id = ?1", [subscription_id])?;
        Ok(recipient)
    }

    pub fn list_subscriptions(&self, recipient: RecipientId) -> Result<Vec<Subscription>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s
             JOIN events e ON e.id = s.event_id
             WHERE s.recipient_id = ?1 ORDER BY s.id"
        ))?;
        let rows = stmt.query_map([recipient], subscription_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Notifications

    pub fn recent_notifications(
        &self,
        recipient: RecipientId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT recipient_id, alert_type, event_name, summary, sent_at FROM notifications
             WHERE recipient_id = ?1 ORDER BY sent_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![recipient, limit as i64], |r| {
            Ok(NotificationRecord {
                recipient: r.get(0)?,
                alert_type: r.get(1)?,
                event_name: r.get(2)?,
                summary: r.get(3)?,
                sent_at: from_millis(r.get(4)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Dedup keys

    pub async fn dedup_contains(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached("SELECT 1 FROM dedup_keys WHERE key = ?1")?;
            Ok(stmt.exists([key])?)
        })
        .await
    }

    pub async fn dedup_insert(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO dedup_keys (key, created_at) VALUES (?1, ?2)",
                params![key, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn dedup_remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM dedup_keys WHERE key = ?1", [key])?;
            Ok(())
        })
        .await
    }

    /// Remove every key matching a glob pattern (`*`, `?`, `[...]`).
    pub async fn dedup_remove_matching(&self, pattern: &str) -> Result<u64> {
        let pattern = pattern.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute("DELETE FROM dedup_keys WHERE key GLOB ?1", [pattern])?;
            Ok(removed as u64)
        })
        .await
    }
}

// Statement helpers, run on the blocking pool

fn insert_events(conn: &mut Connection, events: &[LiquidationEvent]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO liquidation_events
                (symbol, side, price, quantity, usd_value, exchange, event_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for ev in events {
            inserted += stmt.execute(params![
                ev.symbol,
                ev.side.as_str(),
                ev.price,
                ev.quantity,
                ev.usd_value,
                ev.exchange,
                ev.event_time.timestamp_millis(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

fn select_max_pain(
    conn: &Connection,
    symbol: &str,
    window: Duration,
    bin_width: f64,
) -> Result<MaxPainBuckets> {
    if bin_width <= 0.0 {
        return Err(anyhow!("bin width must be positive, got {}", bin_width));
    }
    let since = cutoff_millis(window);
    let mut stmt = conn.prepare_cached(
        "SELECT side, ROUND(price / ?2) * ?2 AS bucket, SUM(usd_value) AS total
         FROM liquidation_events
         WHERE symbol = ?1 AND event_time >= ?3
         GROUP BY side, bucket
         ORDER BY total DESC",
    )?;
    let mut rows = stmt.query(params![symbol, bin_width, since])?;

    let mut result = MaxPainBuckets::default();
    let (mut have_long, mut have_short) = (false, false);
    while let Some(row) = rows.next()? {
        let side: String = row.get(0)?;
        let bucket = PriceBucket {
            price: row.get(1)?,
            usd_value: row.get(2)?,
        };
        match LiquidationSide::parse(&side) {
            Some(LiquidationSide::Long) if !have_long => {
                result.long = bucket;
                have_long = true;
            }
            Some(LiquidationSide::Short) if !have_short => {
                result.short = bucket;
                have_short = true;
            }
            _ => {}
        }
        if have_long && have_short {
            break;
        }
    }
    Ok(result)
}

fn select_latest_price(conn: &Connection, symbol: &str) -> Result<f64> {
    let price = conn
        .query_row(
            "SELECT price FROM liquidation_events WHERE symbol = ?1
             ORDER BY event_time DESC, id DESC LIMIT 1",
            [symbol],
            |r| r.get::<_, f64>(0),
        )
        .optional()?;
    Ok(price.unwrap_or(0.0))
}

fn delete_older(conn: &Connection, age: Duration) -> Result<u64> {
    let cutoff = cutoff_millis(age);
    let removed = conn.execute("DELETE FROM liquidation_events WHERE event_time < ?1", [cutoff])?;
    Ok(removed as u64)
}

fn select_subscribers(conn: &Connection, event_name: &str) -> Result<Vec<Subscription>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions s
         JOIN events e ON e.id = s.event_id
         WHERE e.name = ?1 AND e.enabled = 1 ORDER BY s.id"
    ))?;
    let rows = stmt.query_map([event_name], subscription_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn select_digest_subscribers(conn: &Connection, event_name: &str, hour: u32) -> Result<Vec<RecipientId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT s.recipient_id FROM subscriptions s
         JOIN events e ON e.id = s.event_id
         WHERE e.name = ?1 AND e.enabled = 1 AND s.digest_hour = ?2
         ORDER BY s.id",
    )?;
    let rows = stmt.query_map(params![event_name, hour], |r| r.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn insert_notification(conn: &Connection, record: &NotificationRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications (recipient_id, alert_type, event_name, summary, sent_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.recipient,
            record.alert_type,
            record.event_name,
            record.summary,
            record.sent_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl LiquidationStore for SqliteStore {
    async fn insert_liquidation_events(&self, events: &[LiquidationEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let events = events.to_vec();
        let total = events.len();
        let inserted = self.blocking(move |conn| insert_events(conn, &events)).await?;
        if inserted < total {
            warn!(total, inserted, "Skipped already stored liquidation events");
        }
        debug!(count = inserted, "Inserted liquidation events");
        Ok(())
    }

    async fn query_max_pain(
        &self,
        symbol: &str,
        window: Duration,
        bin_width: f64,
    ) -> Result<MaxPainBuckets> {
        let symbol = symbol.to_string();
        self.blocking(move |conn| select_max_pain(conn, &symbol, window, bin_width))
            .await
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64> {
        let symbol = symbol.to_string();
        self.blocking(move |conn| select_latest_price(conn, &symbol)).await
    }

    async fn delete_events_older_than(&self, age: Duration) -> Result<u64> {
        self.blocking(move |conn| delete_older(conn, age)).await
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn subscribers_with_rules(&self, event_name: &str) -> Result<Vec<Subscription>> {
        let event_name = event_name.to_string();
        self.blocking(move |conn| select_subscribers(conn, &event_name)).await
    }

    async fn digest_subscribers(&self, event_name: &str, hour: u32) -> Result<Vec<RecipientId>> {
        let event_name = event_name.to_string();
        self.blocking(move |conn| select_digest_subscribers(conn, &event_name, hour))
            .await
    }

    async fn log_notification(&self, record: &NotificationRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |conn| insert_notification(conn, &record)).await
    }
}

fn subscription_from_row(r: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: r.get(0)?,
        recipient: r.get(1)?,
        event_name: r.get(2)?,
        rule: SubscriptionRule {
            threshold_pct: r.get(3)?,
            window: r.get(4)?,
            direction: r.get(5)?,
            threshold_value: r.get(6)?,
            digest_hour: r.get(7)?,
            coin: r.get(8)?,
        },
    })
}

fn cutoff_millis(age: Duration) -> i64 {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
    (Utc::now() - age).timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
