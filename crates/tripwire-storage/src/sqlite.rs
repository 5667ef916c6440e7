use crate::error::{Result, StorageError};
use crate::{
    EventLog, LockStore, MetricStore, NotificationStore, SubscriptionStore, ThrottlingStore,
    ThrottlingTxn, TriggerStore, DEFAULT_RETENTION_SECS,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tripwire_common::types::{
    AbandonedNotification, CheckResult, Contact, Event, Sample, ScheduledNotification,
    Subscription, ThrottlingRecord, Trigger,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    metric TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    value REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_metric_time ON metrics(metric, timestamp);
CREATE TABLE IF NOT EXISTS metric_retentions (
    metric TEXT PRIMARY KEY,
    retention_secs INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS triggers (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS last_checks (
    trigger_id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS check_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger_id TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    trigger_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_trigger_time ON events(trigger_id, timestamp);
CREATE TABLE IF NOT EXISTS event_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    visible_at INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trigger_locks (
    key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS throttling (
    trigger_id TEXT PRIMARY KEY,
    next_allowed INTEGER NOT NULL,
    window_start INTEGER NOT NULL,
    level INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS subscription_tags (
    tag TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    PRIMARY KEY (tag, subscription_id)
);
CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS notifications (
    key TEXT PRIMARY KEY,
    due_at INTEGER NOT NULL,
    claimed_until INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_due ON notifications(due_at);
CREATE TABLE IF NOT EXISTS abandoned_notifications (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    abandoned_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
";

/// SQLite-backed store in WAL mode.
///
/// Several processes may open the same database file. Every mutating call
/// runs as one statement or inside a `BEGIN IMMEDIATE` transaction, which
/// takes the database write lock up front, so leases, pops, claims and
/// throttling decisions stay atomic across processes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "Opened SQLite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn set_retention(&self, metric: &str, retention: Duration) -> Result<()> {
        self.conn().execute(
            "INSERT INTO metric_retentions (metric, retention_secs) VALUES (?1, ?2)
             ON CONFLICT(metric) DO UPDATE SET retention_secs = excluded.retention_secs",
            params![metric, retention.num_seconds()],
        )?;
        Ok(())
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_body<T: DeserializeOwned>(&self, sql: &str, id: &str) -> Result<Option<T>> {
        let body: Option<String> = self
            .conn()
            .query_row(sql, params![id], |row| row.get(0))
            .optional()?;
        body.map(|b| decode(&b)).transpose()
    }

    fn put_body<T: Serialize>(&self, sql: &str, id: &str, value: &T) -> Result<()> {
        self.conn().execute(sql, params![id, encode(value)?])?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64, column: &'static str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(StorageError::InvalidTimestamp(ms, column))
}

fn decode_all<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>> {
    bodies.iter().map(|b| decode(b)).collect()
}

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let body = encode(event)?;
    conn.execute(
        "INSERT OR IGNORE INTO events (id, trigger_id, timestamp, body) VALUES (?1, ?2, ?3, ?4)",
        params![event.id, event.trigger_id, millis(event.timestamp), body],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO event_queue (event_id, visible_at, body) VALUES (?1, 0, ?2)",
        params![event.id, body],
    )?;
    Ok(())
}

fn upsert_last_check(conn: &Connection, id: &str, check: &CheckResult) -> Result<()> {
    conn.execute(
        "INSERT INTO last_checks (trigger_id, body) VALUES (?1, ?2)
         ON CONFLICT(trigger_id) DO UPDATE SET body = excluded.body",
        params![id, encode(check)?],
    )?;
    Ok(())
}

fn select_throttling(conn: &Connection, trigger_id: &str) -> Result<Option<ThrottlingRecord>> {
    let row: Option<(i64, i64, u32)> = conn
        .query_row(
            "SELECT next_allowed, window_start, level FROM throttling WHERE trigger_id = ?1",
            params![trigger_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(next, start, level)| {
        Ok(ThrottlingRecord {
            next_allowed: from_millis(next, "throttling.next_allowed")?,
            window_start: from_millis(start, "throttling.window_start")?,
            level,
        })
    })
    .transpose()
}

fn upsert_throttling(conn: &Connection, trigger_id: &str, record: &ThrottlingRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO throttling (trigger_id, next_allowed, window_start, level)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(trigger_id) DO UPDATE SET next_allowed = excluded.next_allowed,
             window_start = excluded.window_start, level = excluded.level",
        params![
            trigger_id,
            millis(record.next_allowed),
            millis(record.window_start),
            record.level
        ],
    )?;
    Ok(())
}

fn delete_throttling(conn: &Connection, trigger_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM throttling WHERE trigger_id = ?1",
        params![trigger_id],
    )?;
    Ok(())
}

fn count_events(
    conn: &Connection,
    trigger_id: &str,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events
         WHERE trigger_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
        params![trigger_id, millis(from), millis(until)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Throttling access inside an open `BEGIN IMMEDIATE` transaction.
struct SqliteThrottling<'t, 'c> {
    tx: &'t Transaction<'c>,
    trigger_id: &'t str,
}

impl ThrottlingTxn for SqliteThrottling<'_, '_> {
    fn get(&mut self) -> Result<Option<ThrottlingRecord>> {
        select_throttling(self.tx, self.trigger_id)
    }

    fn set(&mut self, record: &ThrottlingRecord) -> Result<()> {
        upsert_throttling(self.tx, self.trigger_id, record)
    }

    fn delete(&mut self) -> Result<()> {
        delete_throttling(self.tx, self.trigger_id)
    }

    fn count_events(&mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64> {
        count_events(self.tx, self.trigger_id, from, until)
    }
}

impl MetricStore for SqliteStore {
    fn fetch_samples(
        &self,
        targets: &[String],
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<Sample>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, value FROM metrics
             WHERE metric = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC",
        )?;
        let mut result = HashMap::new();
        for target in targets {
            let rows = stmt
                .query_map(params![target, millis(from), millis(until)], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let samples = rows
                .into_iter()
                .map(|(ts, value)| {
                    Ok(Sample {
                        timestamp: from_millis(ts, "metrics.timestamp")?,
                        value,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            result.insert(target.clone(), samples);
        }
        Ok(result)
    }

    fn get_retention(&self, metric: &str) -> Result<Duration> {
        let secs: Option<i64> = self
            .conn()
            .query_row(
                "SELECT retention_secs FROM metric_retentions WHERE metric = ?1",
                params![metric],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Duration::seconds(secs.unwrap_or(DEFAULT_RETENTION_SECS)))
    }

    fn save_samples(&self, metric: &str, samples: &[Sample]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO metrics (metric, timestamp, value) VALUES (?1, ?2, ?3)",
            )?;
            for sample in samples {
                stmt.execute(params![metric, millis(sample.timestamp), sample.value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl TriggerStore for SqliteStore {
    fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        self.get_body("SELECT body FROM triggers WHERE id = ?1", id)
    }

    fn list_trigger_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT id FROM triggers ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.put_body(
            "INSERT INTO triggers (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            &trigger.id,
            trigger,
        )
    }

    fn save_last_check(&self, id: &str, check: &CheckResult) -> Result<()> {
        upsert_last_check(&self.conn(), id, check)
    }

    fn record_check(&self, id: &str, check: &CheckResult, event: Option<&Event>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(event) = event {
            insert_event(&tx, event)?;
        }
        upsert_last_check(&tx, id, check)?;
        tx.commit()?;
        Ok(())
    }

    fn get_last_check(&self, id: &str) -> Result<Option<CheckResult>> {
        self.get_body("SELECT body FROM last_checks WHERE trigger_id = ?1", id)
    }

    fn add_trigger_to_check(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO check_queue (trigger_id) VALUES (?1)",
            params![id],
        )?;
        Ok(())
    }

    fn pop_trigger_to_check(&self) -> Result<Option<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, trigger_id FROM check_queue ORDER BY seq LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((seq, _)) = &next {
            tx.execute("DELETE FROM check_queue WHERE seq = ?1", params![seq])?;
        }
        tx.commit()?;
        Ok(next.map(|(_, id)| id))
    }
}

impl EventLog for SqliteStore {
    fn append_event(&self, event: &Event) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_event(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    fn fetch_event(&self, now: DateTime<Utc>, visibility: Duration) -> Result<Option<Event>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, body FROM event_queue WHERE visible_at <= ?1 ORDER BY seq LIMIT 1",
                params![millis(now)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((seq, body)) = next else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE event_queue SET visible_at = ?1 WHERE seq = ?2",
            params![millis(now + visibility), seq],
        )?;
        tx.commit()?;
        decode(&body).map(Some)
    }

    fn ack_event(&self, event_id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM event_queue WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    fn get_events(
        &self,
        trigger_id: &str,
        from: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT body FROM events WHERE trigger_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC, id DESC LIMIT ?3",
        )?;
        let bodies = stmt
            .query_map(params![trigger_id, millis(from), limit as i64], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        decode_all(bodies)
    }
}

impl LockStore for SqliteStore {
    fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        // A single upsert: the update branch only fires over an expired lease.
        let changed = self.conn().execute(
            "INSERT INTO trigger_locks (key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE trigger_locks.expires_at <= ?4",
            params![key, owner, millis(now + lease), millis(now)],
        )?;
        Ok(changed == 1)
    }

    fn release_lock(&self, key: &str, owner: &str) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM trigger_locks WHERE key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(deleted == 1)
    }

    fn lock_holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT owner FROM trigger_locks WHERE key = ?1 AND expires_at > ?2",
                params![key, millis(now)],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl ThrottlingStore for SqliteStore {
    fn with_throttling(
        &self,
        trigger_id: &str,
        decide: &mut dyn FnMut(&mut dyn ThrottlingTxn) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        decide(&mut SqliteThrottling {
            tx: &tx,
            trigger_id,
        })?;
        tx.commit()?;
        Ok(())
    }

    fn get_throttling(&self, trigger_id: &str) -> Result<Option<ThrottlingRecord>> {
        select_throttling(&self.conn(), trigger_id)
    }

    fn set_throttling(&self, trigger_id: &str, record: &ThrottlingRecord) -> Result<()> {
        upsert_throttling(&self.conn(), trigger_id, record)
    }

    fn delete_throttling(&self, trigger_id: &str) -> Result<()> {
        delete_throttling(&self.conn(), trigger_id)
    }

    fn count_trigger_events(
        &self,
        trigger_id: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        count_events(&self.conn(), trigger_id, from, until)
    }
}

impl SubscriptionStore for SqliteStore {
    fn get_tags_subscriptions(&self, tags: &BTreeSet<String>) -> Result<Vec<Subscription>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.body FROM subscriptions s
             JOIN subscription_tags t ON t.subscription_id = s.id
             WHERE t.tag = ?1",
        )?;
        let mut found: BTreeMap<String, String> = BTreeMap::new();
        for tag in tags {
            let rows = stmt
                .query_map(params![tag], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            found.extend(rows);
        }
        decode_all(found.into_values().collect())
    }

    fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.get_body("SELECT body FROM contacts WHERE id = ?1", id)
    }

    fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        let body = encode(subscription)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO subscriptions (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![subscription.id, body],
        )?;
        tx.execute(
            "DELETE FROM subscription_tags WHERE subscription_id = ?1",
            params![subscription.id],
        )?;
        for tag in &subscription.tags {
            tx.execute(
                "INSERT INTO subscription_tags (tag, subscription_id) VALUES (?1, ?2)",
                params![tag, subscription.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn save_contact(&self, contact: &Contact) -> Result<()> {
        self.put_body(
            "INSERT INTO contacts (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            &contact.id,
            contact,
        )
    }
}

impl NotificationStore for SqliteStore {
    fn add_notification(&self, notification: &ScheduledNotification) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO notifications (key, due_at, body) VALUES (?1, ?2, ?3)",
            params![
                notification.key(),
                millis(notification.due_at),
                encode(notification)?
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_notifications(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT body FROM notifications WHERE due_at >= ?1 AND due_at <= ?2
             ORDER BY due_at, key",
        )?;
        let bodies = stmt
            .query_map(params![millis(from), millis(until)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        decode_all(bodies)
    }

    fn count_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM notifications WHERE due_at <= ?1 AND claimed_until <= ?1",
            params![millis(now)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim: Duration,
    ) -> Result<Vec<ScheduledNotification>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
            let mut stmt = tx.prepare_cached(
                "SELECT key, body FROM notifications WHERE due_at <= ?1 AND claimed_until <= ?1
                 ORDER BY due_at, key LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![millis(now), limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            rows
        };
        {
            let mut update =
                tx.prepare_cached("UPDATE notifications SET claimed_until = ?2 WHERE key = ?1")?;
            for (key, _) in &rows {
                update.execute(params![key, millis(now + claim)])?;
            }
        }
        tx.commit()?;
        decode_all(rows.into_iter().map(|(_, body)| body).collect())
    }

    fn remove_notification(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM notifications WHERE key = ?1", params![key])?;
        Ok(deleted == 1)
    }

    fn requeue_notification(&self, notification: &ScheduledNotification) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE notifications SET due_at = ?2, body = ?3, claimed_until = 0 WHERE key = ?1",
            params![
                notification.key(),
                millis(notification.due_at),
                encode(notification)?
            ],
        )?;
        Ok(updated == 1)
    }

    fn abandon_notification(&self, abandoned: &AbandonedNotification) -> Result<()> {
        let key = abandoned.notification.key();
        let body = encode(abandoned)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM notifications WHERE key = ?1", params![key])?;
        tx.execute(
            "INSERT INTO abandoned_notifications (key, abandoned_at, body) VALUES (?1, ?2, ?3)",
            params![key, millis(abandoned.abandoned_at), body],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_abandoned(&self, limit: usize) -> Result<Vec<AbandonedNotification>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT body FROM abandoned_notifications ORDER BY seq DESC LIMIT ?1",
        )?;
        let bodies = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        decode_all(bodies)
    }
}
