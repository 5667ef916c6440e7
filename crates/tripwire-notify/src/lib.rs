//! Event fan-out and notification delivery.
//!
//! The [`notifier::Notifier`] turns each trigger event into scheduled
//! notifications, one per subscribed contact, after applying the
//! [`throttling::ThrottlingPolicy`]. The [`delivery::DeliveryPool`] pops
//! due notifications and hands them to the [`Sender`] registered for the
//! contact type.

pub mod channels;
pub mod delivery;
pub mod error;
pub mod notifier;
pub mod registry;
pub mod scheduler;
pub mod subscription;
pub mod throttling;


use async_trait::async_trait;
use error::SendError;
use std::collections::HashMap;
use tripwire_common::types::{Contact, Event, TriggerSnapshot};

/// A delivery channel for one contact type (e.g. `"webhook"`).
///
/// Implementations are registered in the [`registry::SenderRegistry`] under
/// their contact type.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Applies channel settings from configuration. Called once before the
    /// sender is registered.
    async fn init(&mut self, settings: &HashMap<String, String>) -> Result<(), SendError>;

    /// Delivers a package of events for one trigger to one contact.
    /// `throttled` marks a package that was deferred and collapsed by
    /// throttling.
    ///
    /// # Errors
    ///
    /// [`SendError::Transient`] when a later retry may succeed,
    /// [`SendError::Permanent`] when it never will.
    async fn send(
        &self,
        events: &[Event],
        contact: &Contact,
        trigger: &TriggerSnapshot,
        throttled: bool,
    ) -> Result<(), SendError>;
}

/// Waits for `duration`, returning `true` early if `cancel` fires.
pub(crate) async fn wait_or_cancel(
    cancel: &tokio_util::sync::CancellationToken,
    duration: std::time::Duration,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
