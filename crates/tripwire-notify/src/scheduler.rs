use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;
use tripwire_common::types::{Contact, Event, ScheduledNotification, TriggerSnapshot};
use tripwire_storage::error::Result;
use tripwire_storage::NotificationStore;

/// Persists delivery intents. One record exists per (event, contact) pair.
pub struct NotificationScheduler {
    store: Arc<dyn NotificationStore>,
}

impl NotificationScheduler {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Schedules `event` for `contact` at `due_at`. Returns `false` when the
    /// pair is already pending, in which case nothing changes.
    pub fn schedule(
        &self,
        event: &Event,
        contact: &Contact,
        trigger: &TriggerSnapshot,
        throttled: bool,
        due_at: DateTime<Utc>,
    ) -> Result<bool> {
        let notification = ScheduledNotification {
            event: event.clone(),
            contact: contact.clone(),
            trigger: trigger.clone(),
            due_at,
            throttled,
            attempt: 0,
            created_at: Utc::now(),
        };
        let inserted = self.store.add_notification(&notification)?;
        if inserted {
            debug!(key = %notification.key(), due_at = %due_at, throttled, "Notification scheduled");
        } else {
            debug!(key = %notification.key(), "Notification already scheduled");
        }
        Ok(inserted)
    }
}
