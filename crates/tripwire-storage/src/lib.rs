//! Store contracts for the evaluation and notification engine.
//!
//! The engine only ever touches persistent state through these traits.
//! Every call that must be atomic across processes (lease compare-and-set,
//! event claim, check commit, due-notification claim, insert-if-absent) is
//! a single method, so a backend can run it as one transaction. Throttling
//! runs its read-count-write decision through
//! [`ThrottlingStore::with_throttling`] for the same reason. Two backends ship with the
//! crate: [`memory::MemoryStore`] for tests and single-process runs, and
//! [`sqlite::SqliteStore`], which several processes may share.

pub mod error;
pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration, Utc};
use error::Result;
use std::collections::{BTreeSet, HashMap};
use tripwire_common::types::{
    AbandonedNotification, CheckResult, Contact, Event, Sample, ScheduledNotification,
    Subscription, ThrottlingRecord, Trigger,
};

/// Retention reported for metrics with no configured retention.
pub const DEFAULT_RETENTION_SECS: i64 = 60;

/// Read access to metric samples.
pub trait MetricStore: Send + Sync {
    /// Returns the samples of each target inside `[from, until]`, oldest
    /// first. Targets without samples map to an empty vector.
    fn fetch_samples(
        &self,
        targets: &[String],
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<Sample>>>;

    /// Resolution at which the metric is stored.
    fn get_retention(&self, metric: &str) -> Result<Duration>;

    /// Appends samples for a metric. Used by ingestion front ends and tests.
    fn save_samples(&self, metric: &str, samples: &[Sample]) -> Result<()>;
}

/// Trigger definitions, their last check, and the check queue.
pub trait TriggerStore: Send + Sync {
    fn get_trigger(&self, id: &str) -> Result<Option<Trigger>>;

    fn list_trigger_ids(&self) -> Result<Vec<String>>;

    fn save_trigger(&self, trigger: &Trigger) -> Result<()>;

    fn save_last_check(&self, id: &str, check: &CheckResult) -> Result<()>;

    /// Commits one check cycle: appends `event` to history and the event
    /// queue, if there is one, and saves `check` as the last check. Either
    /// all of it is written or none of it is.
    fn record_check(&self, id: &str, check: &CheckResult, event: Option<&Event>) -> Result<()>;

    fn get_last_check(&self, id: &str) -> Result<Option<CheckResult>>;

    /// Adds a trigger to the check queue. Already-queued ids are not
    /// duplicated.
    fn add_trigger_to_check(&self, id: &str) -> Result<()>;

    /// Atomically removes and returns the oldest queued trigger id.
    fn pop_trigger_to_check(&self) -> Result<Option<String>>;
}

/// Append-only event history plus the at-least-once event queue.
pub trait EventLog: Send + Sync {
    /// Records the event in history and enqueues it for the notifier.
    fn append_event(&self, event: &Event) -> Result<()>;

    /// Claims the oldest queued event that is not claimed by someone else.
    /// The claim lapses after `visibility`, after which the event is handed
    /// out again unless it was acked.
    fn fetch_event(&self, now: DateTime<Utc>, visibility: Duration) -> Result<Option<Event>>;

    /// Removes a claimed event from the queue. History is kept.
    fn ack_event(&self, event_id: &str) -> Result<()>;

    /// History of a trigger since `from`, newest first.
    fn get_events(&self, trigger_id: &str, from: DateTime<Utc>, limit: usize)
        -> Result<Vec<Event>>;
}

/// Expiring leases keyed by trigger ID.
pub trait LockStore: Send + Sync {
    /// Atomic compare-and-set: takes the lease for `owner` when no
    /// unexpired lease exists. Returns whether the lease was taken.
    fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool>;

    /// Deletes the lease only if `owner` holds it. Returns whether a lease
    /// was deleted.
    fn release_lock(&self, key: &str, owner: &str) -> Result<bool>;

    /// Owner of the unexpired lease on `key`, if any.
    fn lock_holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>>;
}

/// Throttling state of one trigger inside a [`ThrottlingStore::with_throttling`]
/// transaction.
pub trait ThrottlingTxn {
    fn get(&mut self) -> Result<Option<ThrottlingRecord>>;

    fn set(&mut self, record: &ThrottlingRecord) -> Result<()>;

    fn delete(&mut self) -> Result<()>;

    /// Number of history events for the trigger inside `[from, until]`.
    fn count_events(&mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64>;
}

/// Per-trigger throttling state.
pub trait ThrottlingStore: Send + Sync {
    /// Runs `decide` against the trigger's throttling state as one
    /// transaction. Concurrent callers for the same store are serialized.
    /// When `decide` returns an error nothing it did is kept.
    fn with_throttling(
        &self,
        trigger_id: &str,
        decide: &mut dyn FnMut(&mut dyn ThrottlingTxn) -> Result<()>,
    ) -> Result<()>;

    fn get_throttling(&self, trigger_id: &str) -> Result<Option<ThrottlingRecord>>;

    fn set_throttling(&self, trigger_id: &str, record: &ThrottlingRecord) -> Result<()>;

    fn delete_throttling(&self, trigger_id: &str) -> Result<()>;

    /// Number of history events for the trigger with a timestamp inside
    /// `[from, until]`.
    fn count_trigger_events(
        &self,
        trigger_id: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Subscriptions and contacts. Read-only to the engine apart from the
/// `save_*` methods used by administration tooling.
pub trait SubscriptionStore: Send + Sync {
    /// Subscriptions sharing at least one tag with `tags`. Callers apply the
    /// exact matching rule.
    fn get_tags_subscriptions(&self, tags: &BTreeSet<String>) -> Result<Vec<Subscription>>;

    fn get_contact(&self, id: &str) -> Result<Option<Contact>>;

    fn save_subscription(&self, subscription: &Subscription) -> Result<()>;

    fn save_contact(&self, contact: &Contact) -> Result<()>;
}

/// Pending notifications ordered by due time, plus the abandoned audit log.
pub trait NotificationStore: Send + Sync {
    /// Inserts the notification unless one with the same key is pending.
    /// Returns whether it was inserted.
    fn add_notification(&self, notification: &ScheduledNotification) -> Result<bool>;

    /// Pending notifications due inside `[from, until]`, earliest first.
    fn get_notifications(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>>;

    /// Number of unclaimed pending notifications with `due_at <= now`.
    fn count_due(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Atomically claims up to `limit` unclaimed notifications with
    /// `due_at <= now`, earliest first, and returns them. A claimed record
    /// stays pending but leaves the due set until `now + claim`, so it is
    /// handed to exactly one caller until the claim lapses. The claimer
    /// settles each record with [`remove_notification`],
    /// [`requeue_notification`] or [`abandon_notification`]; a record it
    /// never settles becomes due again.
    ///
    /// [`remove_notification`]: NotificationStore::remove_notification
    /// [`requeue_notification`]: NotificationStore::requeue_notification
    /// [`abandon_notification`]: NotificationStore::abandon_notification
    fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim: Duration,
    ) -> Result<Vec<ScheduledNotification>>;

    /// Deletes a pending notification by key. Returns whether it existed.
    fn remove_notification(&self, key: &str) -> Result<bool>;

    /// Replaces the pending record with the same key by `notification` and
    /// releases its claim. Returns `false` when no such record is pending.
    fn requeue_notification(&self, notification: &ScheduledNotification) -> Result<bool>;

    /// Deletes the pending record and appends it to the abandoned log in
    /// one transaction.
    fn abandon_notification(&self, abandoned: &AbandonedNotification) -> Result<()>;

    /// Most recent abandoned notifications, newest first.
    fn list_abandoned(&self, limit: usize) -> Result<Vec<AbandonedNotification>>;
}

/// Every store contract at once, implemented for any type that has them
/// all.
pub trait Store:
    MetricStore
    + TriggerStore
    + EventLog
    + LockStore
    + ThrottlingStore
    + SubscriptionStore
    + NotificationStore
{
}

impl<T> Store for T where
    T: MetricStore
        + TriggerStore
        + EventLog
        + LockStore
        + ThrottlingStore
        + SubscriptionStore
        + NotificationStore
{
}
