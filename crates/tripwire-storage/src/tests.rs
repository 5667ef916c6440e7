use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::error::StorageError;
use crate::{
    EventLog, LockStore, MetricStore, NotificationStore, Store, SubscriptionStore,
    ThrottlingStore, TriggerStore,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tempfile::TempDir;
use tripwire_common::types::{
    AbandonedNotification, CheckResult, Contact, Event, Sample, ScheduledNotification,
    Subscription, ThrottlingRecord, TriggerSnapshot, TriggerState,
};

fn sqlite() -> (TempDir, SqliteStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("tripwire.db")).unwrap();
    (dir, store)
}

/// Runs `check` against a fresh memory store and a fresh SQLite store.
fn for_each_backend(check: impl Fn(Arc<dyn Store>)) {
    check(Arc::new(MemoryStore::new()));
    let (_dir, store) = sqlite();
    check(Arc::new(store));
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn make_event(id: &str, trigger_id: &str, at: DateTime<Utc>) -> Event {
    Event {
        id: id.to_string(),
        trigger_id: trigger_id.to_string(),
        old_state: TriggerState::Ok,
        new_state: TriggerState::Error,
        timestamp: at,
        values: BTreeMap::from([("db.load".to_string(), 95.0)]),
        message: String::new(),
        trigger: TriggerSnapshot {
            id: trigger_id.to_string(),
            name: "db load".to_string(),
            tags: BTreeSet::from(["db".to_string()]),
        },
        reannounce: false,
    }
}

fn make_notification(event_id: &str, contact_id: &str, due_at: DateTime<Utc>) -> ScheduledNotification {
    let event = make_event(event_id, "t1", due_at);
    ScheduledNotification {
        trigger: event.trigger.clone(),
        event,
        contact: Contact {
            id: contact_id.to_string(),
            contact_type: "webhook".to_string(),
            value: "https://hooks.example.com".to_string(),
            owner: "ops".to_string(),
            quiet_hours: None,
        },
        due_at,
        throttled: false,
        attempt: 0,
        created_at: due_at,
    }
}

#[test]
fn lock_is_exclusive_until_expiry() {
    for_each_backend(|store| {
        let lease = Duration::seconds(30);
        assert!(store.try_acquire_lock("t1", "a", ts(0), lease).unwrap());
        assert!(!store.try_acquire_lock("t1", "b", ts(10), lease).unwrap());
        assert_eq!(store.lock_holder("t1", ts(10)).unwrap().as_deref(), Some("a"));

        // Expired lease is acquirable by another owner
        assert!(store.try_acquire_lock("t1", "b", ts(30), lease).unwrap());
        assert_eq!(store.lock_holder("t1", ts(31)).unwrap().as_deref(), Some("b"));
        assert_eq!(store.lock_holder("t1", ts(61)).unwrap(), None);
    });
}

#[test]
fn release_of_foreign_lock_is_noop() {
    for_each_backend(|store| {
        let lease = Duration::seconds(30);
        assert!(store.try_acquire_lock("t1", "a", ts(0), lease).unwrap());
        assert!(!store.release_lock("t1", "b").unwrap());
        assert!(store.lock_holder("t1", ts(1)).unwrap().is_some());
        assert!(store.release_lock("t1", "a").unwrap());
        assert!(!store.release_lock("t1", "a").unwrap());
        assert!(store.try_acquire_lock("t1", "b", ts(2), lease).unwrap());
    });
}

#[test]
fn concurrent_lock_attempts_yield_one_holder() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    SqliteStore::open(&path).unwrap();

    // Separate connections stand in for separate worker processes.
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            std::thread::spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                store
                    .try_acquire_lock("t1", &format!("worker-{i}"), ts(0), Duration::seconds(30))
                    .unwrap()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn add_notification_deduplicates_by_event_and_contact() {
    for_each_backend(|store| {
        let n = make_notification("e1", "c1", ts(0));
        assert!(store.add_notification(&n).unwrap());
        assert!(!store.add_notification(&n).unwrap());
        assert!(store.add_notification(&make_notification("e1", "c2", ts(0))).unwrap());
        assert_eq!(store.count_due(ts(0)).unwrap(), 2);
    });
}

#[test]
fn claim_returns_only_due_records_in_order() {
    for_each_backend(|store| {
        store.add_notification(&make_notification("e2", "c1", ts(20))).unwrap();
        store.add_notification(&make_notification("e1", "c1", ts(10))).unwrap();
        store.add_notification(&make_notification("e3", "c1", ts(100))).unwrap();

        let claim = Duration::seconds(60);
        let claimed = store.claim_due_notifications(ts(50), 10, claim).unwrap();
        let keys: Vec<_> = claimed.iter().map(|n| n.key()).collect();
        assert_eq!(keys, vec!["e1:c1", "e2:c1"]);
        assert!(store.claim_due_notifications(ts(50), 10, claim).unwrap().is_empty());
        assert_eq!(store.count_due(ts(50)).unwrap(), 0);

        // Claimed records stay pending
        assert_eq!(store.get_notifications(ts(0), ts(1000)).unwrap().len(), 3);
        assert!(store.remove_notification("e1:c1").unwrap());
        assert!(!store.remove_notification("e1:c1").unwrap());
    });
}

#[test]
fn unsettled_claim_lapses_and_is_handed_out_again() {
    for_each_backend(|store| {
        store.add_notification(&make_notification("e1", "c1", ts(0))).unwrap();
        let claim = Duration::seconds(60);
        assert_eq!(store.claim_due_notifications(ts(0), 10, claim).unwrap().len(), 1);
        assert!(store.claim_due_notifications(ts(59), 10, claim).unwrap().is_empty());

        let again = store.claim_due_notifications(ts(60), 10, claim).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].key(), "e1:c1");
    });
}

#[test]
fn requeue_releases_claim_with_new_schedule() {
    for_each_backend(|store| {
        store.add_notification(&make_notification("e1", "c1", ts(0))).unwrap();
        let claim = Duration::seconds(600);
        let mut retry = store.claim_due_notifications(ts(0), 10, claim).unwrap().remove(0);
        retry.attempt = 1;
        retry.due_at = ts(10);
        assert!(store.requeue_notification(&retry).unwrap());

        assert_eq!(store.count_due(ts(9)).unwrap(), 0);
        let claimed = store.claim_due_notifications(ts(10), 10, claim).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].due_at, ts(10));

        store.remove_notification("e1:c1").unwrap();
        assert!(!store.requeue_notification(&retry).unwrap());
        assert!(store.get_notifications(ts(0), ts(1000)).unwrap().is_empty());
    });
}

#[test]
fn abandon_moves_record_to_audit_log() {
    for_each_backend(|store| {
        let n = make_notification("e1", "c1", ts(0));
        store.add_notification(&n).unwrap();
        store.claim_due_notifications(ts(0), 10, Duration::seconds(60)).unwrap();
        store
            .abandon_notification(&AbandonedNotification {
                notification: n.clone(),
                reason: "max attempts exceeded".into(),
                attempts: 3,
                abandoned_at: ts(30),
            })
            .unwrap();

        assert!(store.get_notifications(ts(0), ts(1000)).unwrap().is_empty());
        assert_eq!(store.count_due(ts(1000)).unwrap(), 0);
        let abandoned = store.list_abandoned(10).unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].notification, n);
    });
}

#[test]
fn concurrent_claims_never_share_a_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let seed = SqliteStore::open(&path).unwrap();
    for i in 0..100 {
        seed.add_notification(&make_notification(&format!("e{i}"), "c1", ts(0)))
            .unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                let mut keys = Vec::new();
                loop {
                    let batch = store
                        .claim_due_notifications(ts(1), 7, Duration::seconds(600))
                        .unwrap();
                    if batch.is_empty() {
                        break keys;
                    }
                    keys.extend(batch.iter().map(|n| n.key()));
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for key in handle.join().unwrap() {
            assert!(seen.insert(key), "notification claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);
}

#[test]
fn record_check_writes_event_and_check_together() {
    for_each_backend(|store| {
        let check = CheckResult {
            state: TriggerState::Error,
            timestamp: ts(60),
            event_timestamp: Some(ts(60)),
            metrics: BTreeMap::new(),
            message: "db.load = 95".to_string(),
            suppressed: false,
        };
        let event = make_event("e1", "t1", ts(60));
        store.record_check("t1", &check, Some(&event)).unwrap();

        assert_eq!(store.get_last_check("t1").unwrap(), Some(check.clone()));
        assert_eq!(store.get_events("t1", ts(0), 10).unwrap(), vec![event]);
        assert_eq!(
            store.fetch_event(ts(61), Duration::seconds(60)).unwrap().unwrap().id,
            "e1"
        );

        // A cycle without an event only moves the last check
        let quiet = CheckResult {
            timestamp: ts(120),
            ..check
        };
        store.record_check("t1", &quiet, None).unwrap();
        assert_eq!(store.get_last_check("t1").unwrap().unwrap().timestamp, ts(120));
        assert_eq!(store.get_events("t1", ts(0), 10).unwrap().len(), 1);
    });
}

#[test]
fn claimed_event_is_invisible_until_timeout() {
    for_each_backend(|store| {
        store.append_event(&make_event("e1", "t1", ts(0))).unwrap();
        store.append_event(&make_event("e2", "t1", ts(1))).unwrap();

        let visibility = Duration::seconds(60);
        let first = store.fetch_event(ts(2), visibility).unwrap().unwrap();
        assert_eq!(first.id, "e1");
        let second = store.fetch_event(ts(3), visibility).unwrap().unwrap();
        assert_eq!(second.id, "e2");
        assert!(store.fetch_event(ts(4), visibility).unwrap().is_none());

        store.ack_event("e2").unwrap();
        // e1 was never acked and comes back after its claim lapses
        let replay = store.fetch_event(ts(70), visibility).unwrap().unwrap();
        assert_eq!(replay.id, "e1");
        store.ack_event("e1").unwrap();
        assert!(store.fetch_event(ts(200), visibility).unwrap().is_none());

        // History survives acks
        assert_eq!(store.get_events("t1", ts(0), 10).unwrap().len(), 2);
        assert_eq!(store.count_trigger_events("t1", ts(1), ts(10)).unwrap(), 1);
        assert_eq!(store.count_trigger_events("t1", ts(0), ts(0)).unwrap(), 1);
    });
}

#[test]
fn check_queue_is_a_set() {
    for_each_backend(|store| {
        store.add_trigger_to_check("t1").unwrap();
        store.add_trigger_to_check("t2").unwrap();
        store.add_trigger_to_check("t1").unwrap();
        assert_eq!(store.pop_trigger_to_check().unwrap().as_deref(), Some("t1"));
        assert_eq!(store.pop_trigger_to_check().unwrap().as_deref(), Some("t2"));
        assert_eq!(store.pop_trigger_to_check().unwrap(), None);
    });
}

#[test]
fn subscriptions_are_found_by_any_shared_tag() {
    for_each_backend(|store| {
        let sub = Subscription {
            id: "s1".into(),
            owner: "ops".into(),
            tags: BTreeSet::from(["db".to_string(), "prod".to_string()]),
            contacts: vec!["c1".into()],
            enabled: true,
            throttling_enabled: true,
            quiet_hours_policy: Default::default(),
        };
        store.save_subscription(&sub).unwrap();

        let found = store
            .get_tags_subscriptions(&BTreeSet::from(["db".to_string()]))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(store
            .get_tags_subscriptions(&BTreeSet::from(["web".to_string()]))
            .unwrap()
            .is_empty());
        assert!(store.get_contact("c1").unwrap().is_none());
    });
}

#[test]
fn throttling_record_roundtrip_and_delete() {
    for_each_backend(|store| {
        let record = ThrottlingRecord {
            next_allowed: ts(300),
            window_start: ts(0),
            level: 2,
        };
        store.set_throttling("t1", &record).unwrap();
        assert_eq!(store.get_throttling("t1").unwrap(), Some(record));
        store.delete_throttling("t1").unwrap();
        assert_eq!(store.get_throttling("t1").unwrap(), None);
    });
}

#[test]
fn failed_throttling_decision_is_rolled_back() {
    for_each_backend(|store| {
        let before = ThrottlingRecord {
            next_allowed: ts(0),
            window_start: ts(0),
            level: 1,
        };
        store.set_throttling("t1", &before).unwrap();

        let err = store
            .with_throttling("t1", &mut |txn| {
                txn.set(&ThrottlingRecord { level: 9, ..before })?;
                Err(StorageError::Other("decision failed".into()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("decision failed"));
        assert_eq!(store.get_throttling("t1").unwrap(), Some(before));

        store
            .with_throttling("t1", &mut |txn| txn.delete())
            .unwrap();
        assert_eq!(store.get_throttling("t1").unwrap(), None);
    });
}

#[test]
fn throttling_decisions_do_not_lose_updates_across_connections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    SqliteStore::open(&path).unwrap();

    // Each connection plays a separate notifier process bumping the level.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                for _ in 0..25 {
                    store
                        .with_throttling("t1", &mut |txn| {
                            let mut record = txn.get()?.unwrap_or(ThrottlingRecord {
                                next_allowed: ts(0),
                                window_start: ts(0),
                                level: 0,
                            });
                            record.level += 1;
                            txn.set(&record)
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get_throttling("t1").unwrap().unwrap().level, 100);
}

#[test]
fn samples_are_filtered_by_range() {
    for_each_backend(|store| {
        let samples: Vec<_> = (0..5)
            .map(|i| Sample {
                timestamp: ts(i * 60),
                value: i as f64,
            })
            .collect();
        store.save_samples("db.load", &samples).unwrap();

        let fetched = store
            .fetch_samples(&["db.load".to_string(), "missing".to_string()], ts(60), ts(180))
            .unwrap();
        assert_eq!(fetched["db.load"].len(), 3);
        assert!(fetched["missing"].is_empty());
        assert_eq!(store.get_retention("db.load").unwrap(), Duration::seconds(60));
    });
}

#[test]
fn abandoned_notifications_list_newest_first() {
    for_each_backend(|store| {
        for (i, key) in ["e1", "e2"].iter().enumerate() {
            store
                .abandon_notification(&AbandonedNotification {
                    notification: make_notification(key, "c1", ts(0)),
                    reason: "max attempts exceeded".into(),
                    attempts: 3,
                    abandoned_at: ts(i as i64),
                })
                .unwrap();
        }
        let listed = store.list_abandoned(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].notification.event.id, "e2");
    });
}

#[test]
fn memory_store_reports_outage() {
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let err = store.list_trigger_ids().unwrap_err();
    assert!(err.is_unavailable());
    store.set_unavailable(false);
    assert!(store.list_trigger_ids().unwrap().is_empty());
}
