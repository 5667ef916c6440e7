use crate::error::{Result, StorageError};
use crate::{
    EventLog, LockStore, MetricStore, NotificationStore, SubscriptionStore, ThrottlingStore,
    ThrottlingTxn, TriggerStore, DEFAULT_RETENTION_SECS,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tripwire_common::types::{
    AbandonedNotification, CheckResult, Contact, Event, Sample, ScheduledNotification,
    Subscription, ThrottlingRecord, Trigger,
};

struct QueuedEvent {
    event: Event,
    visible_at: DateTime<Utc>,
}

struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

struct PendingNotification {
    notification: ScheduledNotification,
    claimed_until: Option<DateTime<Utc>>,
}

impl PendingNotification {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.notification.due_at <= now && !matches!(self.claimed_until, Some(until) if until > now)
    }
}

#[derive(Default)]
struct Inner {
    samples: HashMap<String, Vec<Sample>>,
    retentions: HashMap<String, Duration>,
    triggers: BTreeMap<String, Trigger>,
    last_checks: HashMap<String, CheckResult>,
    check_queue: VecDeque<String>,
    history: Vec<Event>,
    event_queue: VecDeque<QueuedEvent>,
    locks: HashMap<String, Lease>,
    throttling: HashMap<String, ThrottlingRecord>,
    subscriptions: BTreeMap<String, Subscription>,
    contacts: HashMap<String, Contact>,
    notifications: BTreeMap<String, PendingNotification>,
    abandoned: Vec<AbandonedNotification>,
}

/// In-process store. Each trait call runs under one mutex, which makes
/// every call atomic with respect to every other caller sharing the store.
///
/// [`MemoryStore::set_unavailable`] makes every call fail with
/// [`StorageError::Unavailable`], to exercise outage handling.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_retention(&self, metric: &str, retention: Duration) {
        self.lock_inner()
            .retentions
            .insert(metric.to_string(), retention);
    }

    /// Lock the state, recovering from a poisoned Mutex if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".into()));
        }
        Ok(self.lock_inner())
    }
}

impl Inner {
    fn push_event(&mut self, event: &Event) {
        self.history.push(event.clone());
        self.event_queue.push_back(QueuedEvent {
            event: event.clone(),
            visible_at: DateTime::<Utc>::MIN_UTC,
        });
    }
}

fn count_events(
    history: &[Event],
    trigger_id: &str,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> u64 {
    history
        .iter()
        .filter(|e| e.trigger_id == trigger_id && e.timestamp >= from && e.timestamp <= until)
        .count() as u64
}

/// Staged throttling state; written back only when the decision succeeds.
struct MemoryThrottling<'a> {
    history: &'a [Event],
    trigger_id: &'a str,
    record: Option<ThrottlingRecord>,
}

impl ThrottlingTxn for MemoryThrottling<'_> {
    fn get(&mut self) -> Result<Option<ThrottlingRecord>> {
        Ok(self.record)
    }

    fn set(&mut self, record: &ThrottlingRecord) -> Result<()> {
        self.record = Some(*record);
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        self.record = None;
        Ok(())
    }

    fn count_events(&mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<u64> {
        Ok(count_events(self.history, self.trigger_id, from, until))
    }
}

impl MetricStore for MemoryStore {
    fn fetch_samples(
        &self,
        targets: &[String],
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<Sample>>> {
        let inner = self.state()?;
        Ok(targets
            .iter()
            .map(|target| {
                let samples = inner
                    .samples
                    .get(target)
                    .map(|all| {
                        all.iter()
                            .filter(|s| s.timestamp >= from && s.timestamp <= until)
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default();
                (target.clone(), samples)
            })
            .collect())
    }

    fn get_retention(&self, metric: &str) -> Result<Duration> {
        Ok(self
            .state()?
            .retentions
            .get(metric)
            .copied()
            .unwrap_or_else(|| Duration::seconds(DEFAULT_RETENTION_SECS)))
    }

    fn save_samples(&self, metric: &str, samples: &[Sample]) -> Result<()> {
        let mut inner = self.state()?;
        let series = inner.samples.entry(metric.to_string()).or_default();
        series.extend_from_slice(samples);
        series.sort_by_key(|s| s.timestamp);
        Ok(())
    }
}

impl TriggerStore for MemoryStore {
    fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        Ok(self.state()?.triggers.get(id).cloned())
    }

    fn list_trigger_ids(&self) -> Result<Vec<String>> {
        Ok(self.state()?.triggers.keys().cloned().collect())
    }

    fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.state()?
            .triggers
            .insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    fn save_last_check(&self, id: &str, check: &CheckResult) -> Result<()> {
        self.state()?
            .last_checks
            .insert(id.to_string(), check.clone());
        Ok(())
    }

    fn record_check(&self, id: &str, check: &CheckResult, event: Option<&Event>) -> Result<()> {
        let mut inner = self.state()?;
        if let Some(event) = event {
            inner.push_event(event);
        }
        inner.last_checks.insert(id.to_string(), check.clone());
        Ok(())
    }

    fn get_last_check(&self, id: &str) -> Result<Option<CheckResult>> {
        Ok(self.state()?.last_checks.get(id).cloned())
    }

    fn add_trigger_to_check(&self, id: &str) -> Result<()> {
        let mut inner = self.state()?;
        if !inner.check_queue.iter().any(|queued| queued == id) {
            inner.check_queue.push_back(id.to_string());
        }
        Ok(())
    }

    fn pop_trigger_to_check(&self) -> Result<Option<String>> {
        Ok(self.state()?.check_queue.pop_front())
    }
}

impl EventLog for MemoryStore {
    fn append_event(&self, event: &Event) -> Result<()> {
        self.state()?.push_event(event);
        Ok(())
    }

    fn fetch_event(&self, now: DateTime<Utc>, visibility: Duration) -> Result<Option<Event>> {
        let mut inner = self.state()?;
        let claimed = inner
            .event_queue
            .iter_mut()
            .find(|queued| queued.visible_at <= now)
            .map(|queued| {
                queued.visible_at = now + visibility;
                queued.event.clone()
            });
        Ok(claimed)
    }

    fn ack_event(&self, event_id: &str) -> Result<()> {
        self.state()?
            .event_queue
            .retain(|queued| queued.event.id != event_id);
        Ok(())
    }

    fn get_events(
        &self,
        trigger_id: &str,
        from: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let inner = self.state()?;
        Ok(inner
            .history
            .iter()
            .rev()
            .filter(|e| e.trigger_id == trigger_id && e.timestamp >= from)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl LockStore for MemoryStore {
    fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        let mut inner = self.state()?;
        if inner
            .locks
            .get(key)
            .is_some_and(|held| held.expires_at > now)
        {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    fn release_lock(&self, key: &str, owner: &str) -> Result<bool> {
        let mut inner = self.state()?;
        if inner.locks.get(key).is_some_and(|held| held.owner == owner) {
            inner.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn lock_holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .state()?
            .locks
            .get(key)
            .filter(|held| held.expires_at > now)
            .map(|held| held.owner.clone()))
    }
}

impl ThrottlingStore for MemoryStore {
    fn with_throttling(
        &self,
        trigger_id: &str,
        decide: &mut dyn FnMut(&mut dyn ThrottlingTxn) -> Result<()>,
    ) -> Result<()> {
        let mut guard = self.state()?;
        let inner = &mut *guard;
        let mut txn = MemoryThrottling {
            history: &inner.history,
            trigger_id,
            record: inner.throttling.get(trigger_id).copied(),
        };
        decide(&mut txn)?;
        match txn.record {
            Some(record) => {
                inner.throttling.insert(trigger_id.to_string(), record);
            }
            None => {
                inner.throttling.remove(trigger_id);
            }
        }
        Ok(())
    }

    fn get_throttling(&self, trigger_id: &str) -> Result<Option<ThrottlingRecord>> {
        Ok(self.state()?.throttling.get(trigger_id).copied())
    }

    fn set_throttling(&self, trigger_id: &str, record: &ThrottlingRecord) -> Result<()> {
        self.state()?
            .throttling
            .insert(trigger_id.to_string(), *record);
        Ok(())
    }

    fn delete_throttling(&self, trigger_id: &str) -> Result<()> {
        self.state()?.throttling.remove(trigger_id);
        Ok(())
    }

    fn count_trigger_events(
        &self,
        trigger_id: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(count_events(&self.state()?.history, trigger_id, from, until))
    }
}

impl SubscriptionStore for MemoryStore {
    fn get_tags_subscriptions(&self, tags: &BTreeSet<String>) -> Result<Vec<Subscription>> {
        let inner = self.state()?;
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| !s.tags.is_disjoint(tags))
            .cloned()
            .collect())
    }

    fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        Ok(self.state()?.contacts.get(id).cloned())
    }

    fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.state()?
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    fn save_contact(&self, contact: &Contact) -> Result<()> {
        self.state()?
            .contacts
            .insert(contact.id.clone(), contact.clone());
        Ok(())
    }
}

impl NotificationStore for MemoryStore {
    fn add_notification(&self, notification: &ScheduledNotification) -> Result<bool> {
        let mut inner = self.state()?;
        let key = notification.key();
        if inner.notifications.contains_key(&key) {
            return Ok(false);
        }
        inner.notifications.insert(
            key,
            PendingNotification {
                notification: notification.clone(),
                claimed_until: None,
            },
        );
        Ok(true)
    }

    fn get_notifications(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>> {
        let inner = self.state()?;
        let mut found: Vec<_> = inner
            .notifications
            .values()
            .map(|pending| &pending.notification)
            .filter(|n| n.due_at >= from && n.due_at <= until)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.key().cmp(&b.key())));
        Ok(found)
    }

    fn count_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let inner = self.state()?;
        Ok(inner
            .notifications
            .values()
            .filter(|pending| pending.is_due(now))
            .count() as u64)
    }

    fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim: Duration,
    ) -> Result<Vec<ScheduledNotification>> {
        let mut inner = self.state()?;
        let mut due: Vec<(DateTime<Utc>, String)> = inner
            .notifications
            .iter()
            .filter(|(_, pending)| pending.is_due(now))
            .map(|(key, pending)| (pending.notification.due_at, key.clone()))
            .collect();
        due.sort();
        due.truncate(limit);
        Ok(due
            .into_iter()
            .filter_map(|(_, key)| {
                let pending = inner.notifications.get_mut(&key)?;
                pending.claimed_until = Some(now + claim);
                Some(pending.notification.clone())
            })
            .collect())
    }

    fn remove_notification(&self, key: &str) -> Result<bool> {
        Ok(self.state()?.notifications.remove(key).is_some())
    }

    fn requeue_notification(&self, notification: &ScheduledNotification) -> Result<bool> {
        let mut inner = self.state()?;
        let Some(pending) = inner.notifications.get_mut(&notification.key()) else {
            return Ok(false);
        };
        pending.notification = notification.clone();
        pending.claimed_until = None;
        Ok(true)
    }

    fn abandon_notification(&self, abandoned: &AbandonedNotification) -> Result<()> {
        let mut inner = self.state()?;
        inner.notifications.remove(&abandoned.notification.key());
        inner.abandoned.push(abandoned.clone());
        Ok(())
    }

    fn list_abandoned(&self, limit: usize) -> Result<Vec<AbandonedNotification>> {
        let inner = self.state()?;
        Ok(inner.abandoned.iter().rev().take(limit).cloned().collect())
    }
}
