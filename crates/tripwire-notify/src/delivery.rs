use crate::error::{NotifyError, Result, SendError};
use crate::registry::SenderRegistry;
use crate::wait_or_cancel;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tripwire_common::types::{AbandonedNotification, Event, ScheduledNotification};
use tripwire_storage::NotificationStore;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub workers: usize,
    /// Parallelism once the due backlog exceeds `high_water_mark`.
    pub max_workers: usize,
    pub batch_size: usize,
    pub high_water_mark: u64,
    pub poll_interval: std::time::Duration,
    pub fast_poll_interval: std::time::Duration,
    /// Total send attempts per notification, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a claimed notification stays out of the due set. Must
    /// exceed the slowest send, or a second worker delivers it again.
    pub claim_timeout: Duration,
    /// Pause after a pass that found the store unreachable.
    pub error_backoff: std::time::Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_workers: 8,
            batch_size: 50,
            high_water_mark: 200,
            poll_interval: std::time::Duration::from_secs(1),
            fast_poll_interval: std::time::Duration::from_millis(100),
            max_attempts: 3,
            backoff_base: Duration::seconds(10),
            backoff_max: Duration::minutes(10),
            claim_timeout: Duration::minutes(1),
            error_backoff: std::time::Duration::from_secs(5),
        }
    }
}

impl DeliveryConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2i64
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(i64::MAX);
        let secs = self
            .backoff_base
            .num_seconds()
            .saturating_mul(factor)
            .min(self.backoff_max.num_seconds());
        Duration::seconds(secs)
    }

    /// Wait before the next pass after a failed one.
    pub fn retry_delay(&self, err: &NotifyError) -> std::time::Duration {
        if err.is_unavailable() {
            self.error_backoff
        } else {
            self.poll_interval
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub abandoned: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.claimed += other.claimed;
        self.sent += other.sent;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub due: u64,
    pub parallelism: usize,
    /// The backlog exceeded the high-water mark.
    pub backlogged: bool,
    pub batches: BatchReport,
}

/// Groups claimed records that travel in one package: same contact, same
/// trigger, same throttled flag.
type PackageKey = (String, String, bool);

/// Claims due notifications and delivers them through the registered senders.
///
/// A claimed record stays in the store until it is settled as delivered,
/// requeued or abandoned. When settling fails the claim lapses and the
/// record is delivered again, so a store outage costs a duplicate rather
/// than a lost notification.
pub struct DeliveryPool {
    store: Arc<dyn NotificationStore>,
    senders: Arc<SenderRegistry>,
    config: DeliveryConfig,
}

impl DeliveryPool {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        senders: Arc<SenderRegistry>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            senders,
            config,
        }
    }

    /// One pass: sizes the worker count from the due backlog, then runs that
    /// many batch workers concurrently and joins all of them.
    pub async fn run_pass(self: &Arc<Self>, now: DateTime<Utc>) -> Result<PassReport> {
        let due = self.store.count_due(now)?;
        let backlogged = due > self.config.high_water_mark;
        let parallelism = if backlogged {
            self.config.max_workers.max(self.config.workers)
        } else {
            self.config.workers
        };
        let parallelism = parallelism.max(1);

        let mut report = PassReport {
            due,
            parallelism,
            backlogged,
            batches: BatchReport::default(),
        };
        if due == 0 {
            return Ok(report);
        }
        if backlogged {
            warn!(due, parallelism, "Delivery backlog above high-water mark");
        }

        let workers = usize::try_from(due)
            .unwrap_or(usize::MAX)
            .div_ceil(self.config.batch_size.max(1))
            .min(parallelism);
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let pool = self.clone();
                tokio::spawn(async move { pool.deliver_batch(now).await })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok(Ok(batch)) => report.batches.merge(batch),
                Ok(Err(e)) => error!(error = %e, "Delivery batch failed"),
                Err(e) => error!(error = %e, "Delivery worker task failed"),
            }
        }
        Ok(report)
    }

    /// Claims one batch and delivers it, one `send` per package.
    pub async fn deliver_batch(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let claimed = self.store.claim_due_notifications(
            now,
            self.config.batch_size.max(1),
            self.config.claim_timeout,
        )?;
        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };

        let mut packages: BTreeMap<PackageKey, Vec<ScheduledNotification>> = BTreeMap::new();
        for notification in claimed {
            let key = (
                notification.contact.id.clone(),
                notification.trigger.id.clone(),
                notification.throttled,
            );
            packages.entry(key).or_default().push(notification);
        }

        for (_, records) in packages {
            self.deliver_package(records, now, &mut report).await;
        }
        Ok(report)
    }

    async fn deliver_package(
        &self,
        records: Vec<ScheduledNotification>,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) {
        let Some(first) = records.first() else {
            return;
        };
        let contact = first.contact.clone();
        let trigger = first.trigger.clone();
        let throttled = first.throttled;

        let Some(sender) = self.senders.get(&contact.contact_type) else {
            let reason = format!("no sender for contact type '{}'", contact.contact_type);
            for record in records {
                let attempts = record.attempt;
                self.abandon(record, &reason, attempts, now, report);
            }
            return;
        };

        let mut events: Vec<Event> = records.iter().map(|r| r.event.clone()).collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        events.dedup_by(|a, b| a.id == b.id);

        match sender.send(&events, &contact, &trigger, throttled).await {
            Ok(()) => {
                report.sent += records.len();
                for record in &records {
                    let key = record.key();
                    if let Err(e) = self.store.remove_notification(&key) {
                        error!(
                            key = %key,
                            error = %e,
                            "Failed to settle delivered notification, it will be sent again"
                        );
                    }
                }
                info!(
                    contact_id = %contact.id,
                    trigger_id = %trigger.id,
                    events = events.len(),
                    throttled,
                    "Notification package delivered"
                );
            }
            Err(SendError::Transient(reason)) => {
                warn!(
                    contact_id = %contact.id,
                    trigger_id = %trigger.id,
                    error = %reason,
                    "Transient delivery failure"
                );
                for record in records {
                    self.retry_or_abandon(record, now, report);
                }
            }
            Err(SendError::Permanent(reason)) => {
                for record in records {
                    let attempts = record.attempt.saturating_add(1);
                    self.abandon(record, &reason, attempts, now, report);
                }
            }
        }
    }

    fn retry_or_abandon(
        &self,
        mut record: ScheduledNotification,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) {
        let attempt = record.attempt.saturating_add(1);
        if attempt >= self.config.max_attempts {
            self.abandon(record, "max attempts exceeded", attempt, now, report);
            return;
        }
        record.attempt = attempt;
        record.due_at = now + self.config.backoff(attempt);
        let key = record.key();
        match self.store.requeue_notification(&record) {
            Ok(true) => {
                report.retried += 1;
                debug!(key = %key, attempt, due_at = %record.due_at, "Notification requeued");
            }
            Ok(false) => warn!(key = %key, "Notification vanished before requeue"),
            Err(e) => error!(
                key = %key,
                error = %e,
                "Failed to requeue notification, retrying once its claim lapses"
            ),
        }
    }

    fn abandon(
        &self,
        record: ScheduledNotification,
        reason: &str,
        attempts: u32,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) {
        let key = record.key();
        error!(
            key = %key,
            contact_id = %record.contact.id,
            trigger_id = %record.trigger.id,
            attempts,
            reason,
            "Notification abandoned"
        );
        let abandoned = AbandonedNotification {
            notification: record,
            reason: reason.to_string(),
            attempts,
            abandoned_at: now,
        };
        match self.store.abandon_notification(&abandoned) {
            Ok(()) => report.abandoned += 1,
            Err(e) => error!(
                key = %key,
                error = %e,
                "Failed to record abandoned notification, it stays pending"
            ),
        }
    }

    /// Runs passes until `cancel` fires. The pass in flight finishes first.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            workers = self.config.workers,
            max_workers = self.config.max_workers,
            "Delivery pool started"
        );
        let pool = Arc::new(self);
        while !cancel.is_cancelled() {
            let wait = match pool.run_pass(Utc::now()).await {
                Ok(report) if report.backlogged => pool.config.fast_poll_interval,
                Ok(_) => pool.config.poll_interval,
                Err(e) => {
                    error!(error = %e, "Delivery pass failed");
                    pool.config.retry_delay(&e)
                }
            };
            if wait_or_cancel(&cancel, wait).await {
                break;
            }
        }
        info!("Delivery pool stopped");
    }
}
