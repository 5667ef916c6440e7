use crate::error::SendError;
use crate::Sender;
use async_trait::async_trait;
use std::collections::HashMap;
use tripwire_common::types::{Contact, Event, TriggerSnapshot};

/// Writes packages to the log instead of delivering them.
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn init(&mut self, _settings: &HashMap<String, String>) -> Result<(), SendError> {
        Ok(())
    }

    async fn send(
        &self,
        events: &[Event],
        contact: &Contact,
        trigger: &TriggerSnapshot,
        throttled: bool,
    ) -> Result<(), SendError> {
        let package = super::package(events, contact, trigger, throttled);
        tracing::info!(
            contact_id = %contact.id,
            trigger_id = %trigger.id,
            events = events.len(),
            throttled,
            package = %package,
            "Notification package"
        );
        Ok(())
    }
}
