use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use tripwire_common::types::{Event, ThrottlingRecord, TriggerState};
use tripwire_storage::error::Result;
use tripwire_storage::{ThrottlingStore, ThrottlingTxn};

#[derive(Debug, Clone)]
pub struct ThrottlingConfig {
    /// How far back events count towards the threshold.
    pub lookback: Duration,
    /// Events allowed inside the lookback window before throttling starts.
    pub threshold: u64,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::minutes(10),
            threshold: 3,
            base_interval: Duration::minutes(5),
            max_interval: Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub notify_now: bool,
    /// Earliest time a notification for the event may go out.
    pub next_allowed: DateTime<Utc>,
}

impl ThrottleDecision {
    fn now(now: DateTime<Utc>) -> Self {
        Self {
            notify_now: true,
            next_allowed: now,
        }
    }

    fn deferred(until: DateTime<Utc>) -> Self {
        Self {
            notify_now: false,
            next_allowed: until,
        }
    }
}

/// Per-trigger rate limiting of notifications with escalating intervals.
pub struct ThrottlingPolicy {
    store: Arc<dyn ThrottlingStore>,
    config: ThrottlingConfig,
}

impl ThrottlingPolicy {
    pub fn new(store: Arc<dyn ThrottlingStore>, config: ThrottlingConfig) -> Self {
        Self { store, config }
    }

    /// Decides whether notifications for `event` go out now or are parked
    /// until the trigger's next allowed time.
    ///
    /// Recovery (OK) clears the trigger's throttling state and is never held
    /// back; EXCEPTION is never held back and leaves the state untouched.
    /// While a throttling period is running every event is parked at the same
    /// time, so they leave together as one package.
    ///
    /// The read, count and write run as one store transaction, so notifiers
    /// in different processes never escalate from the same stale record.
    pub fn should_notify(
        &self,
        trigger_id: &str,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<ThrottleDecision> {
        if event.new_state == TriggerState::Exception {
            return Ok(ThrottleDecision::now(now));
        }
        let mut decision = ThrottleDecision::now(now);
        self.store.with_throttling(trigger_id, &mut |txn| {
            decision = self.decide(txn, trigger_id, event, now)?;
            Ok(())
        })?;
        Ok(decision)
    }

    fn decide(
        &self,
        txn: &mut dyn ThrottlingTxn,
        trigger_id: &str,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<ThrottleDecision> {
        if event.new_state == TriggerState::Ok {
            txn.delete()?;
            return Ok(ThrottleDecision::now(now));
        }

        let Some(mut record) = txn.get()? else {
            txn.set(&ThrottlingRecord {
                next_allowed: now,
                window_start: event.timestamp,
                level: 0,
            })?;
            return Ok(ThrottleDecision::now(now));
        };

        if record.next_allowed > now {
            debug!(trigger_id, next_allowed = %record.next_allowed, "Trigger is throttled");
            return Ok(ThrottleDecision::deferred(record.next_allowed));
        }

        let from = (event.timestamp - self.config.lookback).max(record.window_start);
        let count = txn.count_events(from, event.timestamp)?;

        if count > self.config.threshold {
            let interval = self.interval(record.level);
            record.next_allowed = record.next_allowed.max(now + interval);
            record.level = record.level.saturating_add(1);
            txn.set(&record)?;
            info!(
                trigger_id,
                count,
                level = record.level,
                next_allowed = %record.next_allowed,
                "Throttling trigger notifications"
            );
            return Ok(ThrottleDecision::deferred(record.next_allowed));
        }

        if record.level != 0 {
            record.level = 0;
            txn.set(&record)?;
        }
        Ok(ThrottleDecision::now(now))
    }

    /// `base * 2^level`, capped at the maximum interval.
    pub fn interval(&self, level: u32) -> Duration {
        let factor = 2i64.checked_pow(level).unwrap_or(i64::MAX);
        let secs = self
            .config
            .base_interval
            .num_seconds()
            .saturating_mul(factor)
            .min(self.config.max_interval.num_seconds());
        Duration::seconds(secs)
    }
}
