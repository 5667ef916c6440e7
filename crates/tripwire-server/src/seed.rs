use serde::Deserialize;
use std::collections::HashSet;
use tripwire_common::types::{Contact, Subscription, Trigger};
use tripwire_storage::error::Result;
use tripwire_storage::{SubscriptionStore, TriggerStore};

/// JSON document accepted by `tripwire-server seed`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl SeedFile {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read seed file '{path}': {e}"))?;
        let seed = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{path}': {e}"))?;
        Ok(seed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub triggers_created: u32,
    pub triggers_skipped: u32,
    pub contacts_created: u32,
    pub contacts_skipped: u32,
    pub subscriptions_saved: u32,
}

/// Writes the seed into the store. Triggers and contacts that already exist
/// are left untouched; subscriptions are always overwritten.
pub fn apply<S>(store: &S, seed: &SeedFile) -> Result<SeedReport>
where
    S: TriggerStore + SubscriptionStore + ?Sized,
{
    let mut report = SeedReport::default();

    for trigger in &seed.triggers {
        if store.get_trigger(&trigger.id)?.is_some() {
            tracing::warn!(trigger_id = %trigger.id, "Trigger already exists, skipping");
            report.triggers_skipped += 1;
            continue;
        }
        store.save_trigger(trigger)?;
        tracing::info!(trigger_id = %trigger.id, name = %trigger.name, "Trigger created");
        report.triggers_created += 1;
    }

    let mut known_contacts: HashSet<&str> = HashSet::new();
    for contact in &seed.contacts {
        known_contacts.insert(contact.id.as_str());
        if store.get_contact(&contact.id)?.is_some() {
            tracing::warn!(contact_id = %contact.id, "Contact already exists, skipping");
            report.contacts_skipped += 1;
            continue;
        }
        store.save_contact(contact)?;
        tracing::info!(contact_id = %contact.id, contact_type = %contact.contact_type, "Contact created");
        report.contacts_created += 1;
    }

    for subscription in &seed.subscriptions {
        for contact_id in &subscription.contacts {
            if !known_contacts.contains(contact_id.as_str())
                && store.get_contact(contact_id)?.is_none()
            {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    contact_id = %contact_id,
                    "Subscription references an unknown contact"
                );
            }
        }
        store.save_subscription(subscription)?;
        tracing::info!(subscription_id = %subscription.id, "Subscription saved");
        report.subscriptions_saved += 1;
    }

    Ok(report)
}
