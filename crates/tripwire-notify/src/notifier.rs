use crate::error::{NotifyError, Result};
use crate::scheduler::NotificationScheduler;
use crate::subscription::SubscriptionResolver;
use crate::throttling::ThrottlingPolicy;
use crate::wait_or_cancel;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tripwire_common::types::Event;
use tripwire_storage::EventLog;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub poll_interval: Duration,
    /// How long a claimed event stays hidden from other notifiers.
    pub visibility_timeout: chrono::Duration,
    /// Pause after a failure that left the store unreachable.
    pub error_backoff: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            visibility_timeout: chrono::Duration::seconds(60),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl NotifierConfig {
    /// Wait after a failed event. A failure other than an outage leaves
    /// the event claimed, so polling on finds the rest of the queue.
    pub fn retry_delay(&self, err: &NotifyError) -> Duration {
        if err.is_unavailable() {
            self.error_backoff
        } else {
            self.poll_interval
        }
    }
}

/// Consumes trigger events and schedules one notification per recipient.
pub struct Notifier {
    events: Arc<dyn EventLog>,
    resolver: SubscriptionResolver,
    throttling: ThrottlingPolicy,
    scheduler: NotificationScheduler,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(
        events: Arc<dyn EventLog>,
        resolver: SubscriptionResolver,
        throttling: ThrottlingPolicy,
        scheduler: NotificationScheduler,
        config: NotifierConfig,
    ) -> Self {
        Self {
            events,
            resolver,
            throttling,
            scheduler,
            config,
        }
    }

    /// Fans `event` out to its recipients. Returns how many new
    /// notifications were scheduled.
    pub fn process(&self, event: &Event, now: DateTime<Utc>) -> Result<usize> {
        let recipients = self.resolver.recipients(&event.trigger.tags, now)?;
        if recipients.is_empty() {
            debug!(event_id = %event.id, trigger_id = %event.trigger_id, "No subscribers for event");
            return Ok(0);
        }

        let decision = if recipients.iter().any(|r| r.throttling_enabled) {
            Some(self.throttling.should_notify(&event.trigger_id, event, now)?)
        } else {
            None
        };

        let mut scheduled = 0;
        for recipient in &recipients {
            let (throttled, due_at) = match decision {
                Some(d) if recipient.throttling_enabled && !d.notify_now => (true, d.next_allowed),
                _ => (false, now),
            };
            let due_at = recipient.not_before.map_or(due_at, |nb| nb.max(due_at));
            if self.scheduler.schedule(
                event,
                &recipient.contact,
                &event.trigger,
                throttled,
                due_at,
            )? {
                scheduled += 1;
            }
        }
        info!(
            event_id = %event.id,
            trigger_id = %event.trigger_id,
            recipients = recipients.len(),
            scheduled,
            "Event fanned out"
        );
        Ok(scheduled)
    }

    /// Claims, processes and acks one event. Returns `false` when the queue
    /// is empty. On error the event stays claimed and is handed out again
    /// once its visibility timeout lapses.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(event) = self.events.fetch_event(now, self.config.visibility_timeout)? else {
            return Ok(false);
        };
        self.process(&event, now)?;
        self.events.ack_event(&event.id)?;
        Ok(true)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Notifier started");
        while !cancel.is_cancelled() {
            let wait = match self.run_once(Utc::now()) {
                Ok(true) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(false) => self.config.poll_interval,
                Err(e) => {
                    error!(error = %e, "Failed to process event");
                    self.config.retry_delay(&e)
                }
            };
            if wait_or_cancel(&cancel, wait).await {
                break;
            }
        }
        info!("Notifier stopped");
    }
}
