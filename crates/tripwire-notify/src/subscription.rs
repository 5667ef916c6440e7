use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;
use tripwire_common::types::{Contact, QuietHoursPolicy, Subscription};
use tripwire_storage::error::Result;
use tripwire_storage::SubscriptionStore;

/// A contact to notify for an event, as expanded from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub contact: Contact,
    pub subscription_id: String,
    pub throttling_enabled: bool,
    /// Earliest delivery time imposed by the contact's quiet hours.
    pub not_before: Option<DateTime<Utc>>,
}

pub struct SubscriptionResolver {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionResolver {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Enabled subscriptions whose tag filter is a subset of `trigger_tags`.
    pub fn resolve(&self, trigger_tags: &BTreeSet<String>) -> Result<Vec<Subscription>> {
        if trigger_tags.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self.store.get_tags_subscriptions(trigger_tags)?;
        Ok(candidates
            .into_iter()
            .filter(|s| s.enabled && s.matches(trigger_tags))
            .collect())
    }

    /// Loads the subscription's contacts and applies quiet hours at `now`.
    /// Contacts that cannot be loaded are skipped.
    pub fn expand(&self, subscription: &Subscription, now: DateTime<Utc>) -> Vec<Recipient> {
        let mut recipients = Vec::with_capacity(subscription.contacts.len());
        for contact_id in &subscription.contacts {
            let contact = match self.store.get_contact(contact_id) {
                Ok(Some(contact)) => contact,
                Ok(None) => {
                    warn!(
                        subscription_id = %subscription.id,
                        contact_id = %contact_id,
                        "Subscribed contact does not exist, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        contact_id = %contact_id,
                        error = %e,
                        "Failed to load contact, skipping"
                    );
                    continue;
                }
            };

            let quiet_until = contact.quiet_hours.as_ref().and_then(|q| q.active_until(now));
            let not_before = match (quiet_until, subscription.quiet_hours_policy) {
                (Some(_), QuietHoursPolicy::Drop) => continue,
                (until, _) => until,
            };
            recipients.push(Recipient {
                contact,
                subscription_id: subscription.id.clone(),
                throttling_enabled: subscription.throttling_enabled,
                not_before,
            });
        }
        recipients
    }

    /// All recipients for a trigger, one per contact. A contact reached
    /// through several subscriptions bypasses throttling if any of them
    /// does.
    pub fn recipients(
        &self,
        trigger_tags: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recipient>> {
        let mut merged: Vec<Recipient> = Vec::new();
        for subscription in self.resolve(trigger_tags)? {
            for recipient in self.expand(&subscription, now) {
                match merged
                    .iter_mut()
                    .find(|r| r.contact.id == recipient.contact.id)
                {
                    Some(existing) => {
                        existing.throttling_enabled &= recipient.throttling_enabled;
                    }
                    None => merged.push(recipient),
                }
            }
        }
        Ok(merged)
    }
}
