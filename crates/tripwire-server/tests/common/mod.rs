#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tripwire_checker::check::TriggerChecker;
use tripwire_common::types::{
    CompareOp, Condition, Contact, Event, QuietHoursPolicy, Sample, Subscription, Trigger,
    TriggerSnapshot, TriggerState,
};
use tripwire_notify::delivery::DeliveryPool;
use tripwire_notify::error::SendError;
use tripwire_notify::notifier::Notifier;
use tripwire_notify::registry::SenderRegistry;
use tripwire_notify::scheduler::NotificationScheduler;
use tripwire_notify::subscription::SubscriptionResolver;
use tripwire_notify::throttling::ThrottlingPolicy;
use tripwire_notify::Sender;
use tripwire_server::config::Config;
use tripwire_storage::memory::MemoryStore;
use tripwire_storage::{MetricStore, SubscriptionStore, TriggerStore};

pub const CONTACT_TYPE: &str = "recording";

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

/// `db.load > 90` is ERROR, tagged `db`.
pub fn db_trigger(id: &str) -> Trigger {
    Trigger {
        id: id.to_string(),
        name: "db load".to_string(),
        targets: vec!["db.load".to_string()],
        conditions: vec![Condition {
            state: TriggerState::Error,
            operator: CompareOp::GreaterThan,
            value: 90.0,
        }],
        tags: BTreeSet::from(["db".to_string()]),
        nodata_timeout_secs: 600,
        nodata_state: TriggerState::NoData,
        renotify_interval_secs: None,
        maintenance_until: None,
        metric_maintenance: BTreeMap::new(),
    }
}

pub fn contact(id: &str) -> Contact {
    Contact {
        id: id.to_string(),
        contact_type: CONTACT_TYPE.to_string(),
        value: format!("{id}@ops"),
        owner: "ops".to_string(),
        quiet_hours: None,
    }
}

pub fn subscription(id: &str, tags: &[&str], contacts: &[&str]) -> Subscription {
    Subscription {
        id: id.to_string(),
        owner: "ops".to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        contacts: contacts.iter().map(|c| c.to_string()).collect(),
        enabled: true,
        throttling_enabled: true,
        quiet_hours_policy: QuietHoursPolicy::Defer,
    }
}

/// Stores the `db` trigger, contact `c1` and a subscription linking them.
pub fn seed_db_alerting(store: &MemoryStore) {
    store.save_trigger(&db_trigger("t1")).unwrap();
    store.save_contact(&contact("c1")).unwrap();
    store
        .save_subscription(&subscription("s1", &["db"], &["c1"]))
        .unwrap();
}

pub fn push_sample(store: &MemoryStore, metric: &str, at: DateTime<Utc>, value: f64) {
    store
        .save_samples(metric, &[Sample { timestamp: at, value }])
        .unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentPackage {
    pub event_ids: Vec<String>,
    pub contact_id: String,
    pub throttled: bool,
}

/// Records every package. Fails the first `failures` sends with `error`.
#[derive(Default)]
pub struct RecordingSender {
    calls: Mutex<Vec<SentPackage>>,
    failures: Mutex<u32>,
    error: Option<SendError>,
}

impl RecordingSender {
    pub fn failing(error: SendError, failures: u32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(failures),
            error: Some(error),
        }
    }

    pub fn calls(&self) -> Vec<SentPackage> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn init(&mut self, _settings: &HashMap<String, String>) -> Result<(), SendError> {
        Ok(())
    }

    async fn send(
        &self,
        events: &[Event],
        contact: &Contact,
        _trigger: &TriggerSnapshot,
        throttled: bool,
    ) -> Result<(), SendError> {
        self.calls.lock().unwrap().push(SentPackage {
            event_ids: events.iter().map(|e| e.id.clone()).collect(),
            contact_id: contact.id.clone(),
            throttled,
        });
        let mut failures = self.failures.lock().unwrap();
        match &self.error {
            Some(err) if *failures > 0 => {
                *failures -= 1;
                Err(err.clone())
            }
            _ => Ok(()),
        }
    }
}

pub fn registry(sender: Arc<RecordingSender>) -> SenderRegistry {
    let mut registry = SenderRegistry::new();
    registry.register(CONTACT_TYPE, sender);
    registry
}

/// The engine stages wired to one store, driven step by step with explicit
/// timestamps.
pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    pub checker: TriggerChecker,
    pub notifier: Notifier,
    pub delivery: Arc<DeliveryPool>,
    pub sender: Arc<RecordingSender>,
}

pub fn pipeline(config: &Config, sender: RecordingSender) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(sender);
    let checker = TriggerChecker::new(store.clone(), store.clone());
    let notifier = Notifier::new(
        store.clone(),
        SubscriptionResolver::new(store.clone()),
        ThrottlingPolicy::new(store.clone(), config.throttling.to_throttling_config()),
        NotificationScheduler::new(store.clone()),
        config.notifier.to_notifier_config(),
    );
    let delivery = Arc::new(DeliveryPool::new(
        store.clone(),
        Arc::new(registry(sender.clone())),
        config.delivery.to_delivery_config(),
    ));
    Pipeline {
        store,
        checker,
        notifier,
        delivery,
        sender,
    }
}
