use crate::check::{CheckOutcome, TriggerChecker};
use crate::error::{EvaluationError, LockError};
use crate::lock::LockCoordinator;
use crate::state::{self, Evaluation};
use crate::worker::{CheckProducer, CheckerConfig, CheckerPool};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tripwire_common::types::{
    CheckResult, CompareOp, Condition, Event, Sample, Trigger, TriggerState,
};
use tripwire_storage::error::{Result as StoreResult, StorageError};
use tripwire_storage::memory::MemoryStore;
use tripwire_storage::{EventLog, MetricStore, TriggerStore};

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn make_trigger(id: &str) -> Trigger {
    Trigger {
        id: id.to_string(),
        name: "db load".to_string(),
        targets: vec!["db.load".to_string()],
        conditions: vec![
            Condition {
                state: TriggerState::Warn,
                operator: CompareOp::GreaterThan,
                value: 80.0,
            },
            Condition {
                state: TriggerState::Error,
                operator: CompareOp::GreaterThan,
                value: 90.0,
            },
        ],
        tags: BTreeSet::from(["db".to_string()]),
        nodata_timeout_secs: 600,
        nodata_state: TriggerState::NoData,
        renotify_interval_secs: None,
        maintenance_until: None,
        metric_maintenance: BTreeMap::new(),
    }
}

fn samples_at(metric: &str, points: &[(i64, f64)]) -> HashMap<String, Vec<Sample>> {
    HashMap::from([(
        metric.to_string(),
        points
            .iter()
            .map(|(secs, value)| Sample {
                timestamp: ts(*secs),
                value: *value,
            })
            .collect(),
    )])
}

fn last_check(state: TriggerState, at: DateTime<Utc>) -> CheckResult {
    CheckResult {
        state,
        timestamp: at,
        event_timestamp: Some(at),
        metrics: BTreeMap::new(),
        message: String::new(),
        suppressed: false,
    }
}

fn eval_value(trigger: &Trigger, last: Option<&CheckResult>, value: f64) -> Evaluation {
    state::evaluate(trigger, last, &samples_at("db.load", &[(0, value)]), ts(10))
}

#[test]
fn evaluate_is_deterministic() {
    let trigger = make_trigger("t1");
    let last = last_check(TriggerState::Ok, ts(0));
    let samples = samples_at("db.load", &[(0, 50.0), (30, 95.0)]);
    let a = state::evaluate(&trigger, Some(&last), &samples, ts(60));
    let b = state::evaluate(&trigger, Some(&last), &samples, ts(60));
    assert_eq!(a, b);
    assert_eq!(a.check.state, TriggerState::Error);
}

#[test]
fn error_conditions_win_over_warn() {
    let trigger = make_trigger("t1");
    let last = last_check(TriggerState::Ok, ts(0));
    assert_eq!(eval_value(&trigger, Some(&last), 95.0).check.state, TriggerState::Error);
    assert_eq!(eval_value(&trigger, Some(&last), 85.0).check.state, TriggerState::Warn);
    assert_eq!(eval_value(&trigger, Some(&last), 50.0).check.state, TriggerState::Ok);
}

#[test]
fn first_check_emits_only_for_alerting_states() {
    let trigger = make_trigger("t1");
    assert!(eval_value(&trigger, None, 50.0).transition.is_none());

    let alerting = eval_value(&trigger, None, 95.0);
    let transition = alerting.transition.unwrap();
    assert_eq!(transition.old_state, TriggerState::NoData);
    assert_eq!(transition.new_state, TriggerState::Error);

    let nodata = state::evaluate(&trigger, None, &HashMap::new(), ts(10));
    assert_eq!(nodata.check.state, TriggerState::NoData);
    assert!(nodata.transition.is_none());
}

#[test]
fn stale_or_missing_samples_report_nodata_state() {
    let mut trigger = make_trigger("t1");
    let last = last_check(TriggerState::Ok, ts(0));

    // The only sample is older than the no-data timeout
    let stale = samples_at("db.load", &[(0, 50.0)]);
    let eval = state::evaluate(&trigger, Some(&last), &stale, ts(601));
    assert_eq!(eval.check.state, TriggerState::NoData);
    assert!(eval.check.message.contains("no data"));

    trigger.nodata_state = TriggerState::Error;
    let eval = state::evaluate(&trigger, Some(&last), &HashMap::new(), ts(10));
    assert_eq!(eval.check.state, TriggerState::Error);
}

#[test]
fn one_silent_target_degrades_the_trigger() {
    let mut trigger = make_trigger("t1");
    trigger.targets.push("db.conn".to_string());
    let last = last_check(TriggerState::Ok, ts(0));
    let eval = eval_value(&trigger, Some(&last), 95.0);
    assert_eq!(eval.check.state, TriggerState::NoData);
    assert_eq!(eval.check.metrics["db.load"].state, TriggerState::Error);
    assert_eq!(eval.check.metrics["db.conn"].state, TriggerState::NoData);
}

#[test]
fn invalid_inputs_produce_exception() {
    let last = last_check(TriggerState::Ok, ts(0));

    let mut no_targets = make_trigger("t1");
    no_targets.targets.clear();
    let eval = state::evaluate(&no_targets, Some(&last), &HashMap::new(), ts(10));
    assert_eq!(eval.check.state, TriggerState::Exception);
    assert_eq!(eval.check.message, EvaluationError::NoTargets.to_string());

    let trigger = make_trigger("t1");
    let eval = eval_value(&trigger, Some(&last), f64::NAN);
    assert_eq!(eval.check.state, TriggerState::Exception);
    assert!(eval.check.message.contains("non-finite"));

    let mut bad_condition = make_trigger("t1");
    bad_condition.conditions[0].state = TriggerState::Ok;
    let eval = eval_value(&bad_condition, Some(&last), 50.0);
    assert_eq!(eval.check.state, TriggerState::Exception);
    let transition = eval.transition.unwrap();
    assert_eq!(transition.old_state, TriggerState::Ok);
    assert_eq!(transition.new_state, TriggerState::Exception);
}

#[test]
fn evaluation_error_keeps_last_metrics() {
    let trigger = make_trigger("t1");
    let previous = eval_value(&trigger, None, 95.0).check;
    let err = EvaluationError::Fetch(tripwire_storage::error::StorageError::Unavailable(
        "down".into(),
    ));
    let eval = state::evaluate_error(&trigger, Some(&previous), &err, ts(70));
    assert_eq!(eval.check.state, TriggerState::Exception);
    assert_eq!(eval.check.metrics, previous.metrics);
    assert!(eval.check.message.contains("down"));
}

#[test]
fn unchanged_alert_is_reannounced_after_interval() {
    let mut trigger = make_trigger("t1");
    trigger.renotify_interval_secs = Some(600);
    let samples = samples_at("db.load", &[(690, 95.0)]);

    let recent = last_check(TriggerState::Error, ts(200));
    assert!(state::evaluate(&trigger, Some(&recent), &samples, ts(700))
        .transition
        .is_none());

    let old = last_check(TriggerState::Error, ts(100));
    let eval = state::evaluate(&trigger, Some(&old), &samples, ts(700));
    let transition = eval.transition.unwrap();
    assert!(transition.reannounce);
    assert_eq!(transition.old_state, TriggerState::Error);
    assert_eq!(eval.check.event_timestamp, Some(ts(700)));

    // OK is never re-announced
    let ok = last_check(TriggerState::Ok, ts(0));
    let calm = samples_at("db.load", &[(690, 10.0)]);
    assert!(state::evaluate(&trigger, Some(&ok), &calm, ts(700))
        .transition
        .is_none());
}

#[test]
fn maintenance_suppresses_event_but_advances_state() {
    let mut trigger = make_trigger("t1");
    trigger.maintenance_until = Some(ts(3600));
    let last = last_check(TriggerState::Ok, ts(0));
    let eval = eval_value(&trigger, Some(&last), 95.0);
    assert!(eval.transition.is_none());
    assert!(eval.check.suppressed);
    assert_eq!(eval.check.state, TriggerState::Error);
    assert_eq!(eval.check.event_timestamp, Some(ts(0)));

    let mut metric_only = make_trigger("t1");
    metric_only
        .metric_maintenance
        .insert("db.load".to_string(), ts(3600));
    assert!(eval_value(&metric_only, Some(&last), 95.0).transition.is_none());

    // Expired maintenance no longer applies
    trigger.maintenance_until = Some(ts(5));
    assert!(eval_value(&trigger, Some(&last), 95.0).transition.is_some());
}

#[test]
fn event_carries_values_and_snapshot() {
    let trigger = make_trigger("t1");
    let last = last_check(TriggerState::Ok, ts(0));
    let eval = eval_value(&trigger, Some(&last), 95.0);
    let event = eval.event(&trigger, "e1".to_string()).unwrap();
    assert_eq!(event.values["db.load"], 95.0);
    assert_eq!(event.trigger, trigger.snapshot());
    assert_eq!(event.timestamp, ts(10));
    assert!(event.message.contains("db.load = 95"));
}

#[test]
fn check_cycles_emit_one_event_on_transition() {
    let store = Arc::new(MemoryStore::new());
    store.save_trigger(&make_trigger("t1")).unwrap();
    let checker = TriggerChecker::new(store.clone(), store.clone());

    let mut states = Vec::new();
    let mut emitted = Vec::new();
    for (cycle, value) in [50.0, 95.0, 96.0].into_iter().enumerate() {
        let at = ts(cycle as i64 * 60);
        store
            .save_samples("db.load", &[Sample { timestamp: at, value }])
            .unwrap();
        match checker.check("t1", at).unwrap() {
            CheckOutcome::Checked { state, event } => {
                states.push(state);
                if event.is_some() {
                    emitted.push(cycle + 1);
                }
            }
            CheckOutcome::Missing => panic!("trigger is stored"),
        }
    }

    assert_eq!(
        states,
        vec![TriggerState::Ok, TriggerState::Error, TriggerState::Error]
    );
    assert_eq!(emitted, vec![2]);
    let history = store.get_events("t1", ts(0), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_state, TriggerState::Ok);
    assert_eq!(history[0].new_state, TriggerState::Error);
    assert_eq!(
        store.get_last_check("t1").unwrap().unwrap().event_timestamp,
        Some(ts(60))
    );
}

#[test]
fn unreachable_metric_store_is_an_exception() {
    let triggers = Arc::new(MemoryStore::new());
    let metrics = Arc::new(MemoryStore::new());
    triggers.save_trigger(&make_trigger("t1")).unwrap();
    triggers
        .save_last_check("t1", &last_check(TriggerState::Ok, ts(0)))
        .unwrap();
    metrics.set_unavailable(true);

    let checker = TriggerChecker::new(triggers.clone(), metrics.clone());
    match checker.check("t1", ts(60)).unwrap() {
        CheckOutcome::Checked { state, event } => {
            assert_eq!(state, TriggerState::Exception);
            assert!(event.unwrap().message.contains("fetch"));
        }
        CheckOutcome::Missing => panic!("trigger is stored"),
    }
}

/// Trigger store whose first `failures` check commits fail.
struct FlakyCommits {
    inner: Arc<MemoryStore>,
    failures: AtomicU32,
}

impl TriggerStore for FlakyCommits {
    fn get_trigger(&self, id: &str) -> StoreResult<Option<Trigger>> {
        self.inner.get_trigger(id)
    }

    fn list_trigger_ids(&self) -> StoreResult<Vec<String>> {
        self.inner.list_trigger_ids()
    }

    fn save_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
        self.inner.save_trigger(trigger)
    }

    fn save_last_check(&self, id: &str, check: &CheckResult) -> StoreResult<()> {
        self.inner.save_last_check(id, check)
    }

    fn record_check(
        &self,
        id: &str,
        check: &CheckResult,
        event: Option<&Event>,
    ) -> StoreResult<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StorageError::Other("disk I/O error".into()));
        }
        self.inner.record_check(id, check, event)
    }

    fn get_last_check(&self, id: &str) -> StoreResult<Option<CheckResult>> {
        self.inner.get_last_check(id)
    }

    fn add_trigger_to_check(&self, id: &str) -> StoreResult<()> {
        self.inner.add_trigger_to_check(id)
    }

    fn pop_trigger_to_check(&self) -> StoreResult<Option<String>> {
        self.inner.pop_trigger_to_check()
    }
}

#[test]
fn failed_commit_does_not_duplicate_the_event() {
    let store = Arc::new(MemoryStore::new());
    store.save_trigger(&make_trigger("t1")).unwrap();
    store
        .save_last_check("t1", &last_check(TriggerState::Ok, ts(0)))
        .unwrap();
    let triggers = Arc::new(FlakyCommits {
        inner: store.clone(),
        failures: AtomicU32::new(1),
    });
    let checker = TriggerChecker::new(triggers, store.clone());

    store
        .save_samples("db.load", &[Sample { timestamp: ts(60), value: 95.0 }])
        .unwrap();
    assert!(checker.check("t1", ts(60)).is_err());
    assert!(store.get_events("t1", ts(0), 10).unwrap().is_empty());
    assert_eq!(
        store.get_last_check("t1").unwrap().unwrap().state,
        TriggerState::Ok
    );

    store
        .save_samples("db.load", &[Sample { timestamp: ts(120), value: 96.0 }])
        .unwrap();
    match checker.check("t1", ts(120)).unwrap() {
        CheckOutcome::Checked { state, event } => {
            assert_eq!(state, TriggerState::Error);
            assert_eq!(event.unwrap().old_state, TriggerState::Ok);
        }
        CheckOutcome::Missing => panic!("trigger is stored"),
    }

    // The retry emitted the only event; the next cycle is steady.
    store
        .save_samples("db.load", &[Sample { timestamp: ts(180), value: 97.0 }])
        .unwrap();
    checker.check("t1", ts(180)).unwrap();
    let history = store.get_events("t1", ts(0), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].new_state, TriggerState::Error);
}

#[test]
fn worker_backs_off_only_for_unreachable_store() {
    let config = CheckerConfig {
        poll_interval: std::time::Duration::from_millis(10),
        error_backoff: std::time::Duration::from_secs(5),
        ..CheckerConfig::default()
    };
    assert_eq!(
        config.retry_delay(&StorageError::Unavailable("connection refused".into())),
        std::time::Duration::from_secs(5)
    );
    assert_eq!(
        config.retry_delay(&StorageError::Other("corrupt record".into())),
        std::time::Duration::from_millis(10)
    );
}

#[test]
fn deleted_trigger_is_reported_missing() {
    let store = Arc::new(MemoryStore::new());
    let checker = TriggerChecker::new(store.clone(), store.clone());
    assert_eq!(checker.check("gone", ts(0)).unwrap(), CheckOutcome::Missing);
}

#[test]
fn only_one_concurrent_acquirer_wins() {
    let store = Arc::new(MemoryStore::new());
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let locks = LockCoordinator::with_owner(store, format!("worker-{i}"));
                locks
                    .acquire_at("t1", ts(0), Duration::seconds(30))
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
fn expired_lease_passes_to_next_owner() {
    let store = Arc::new(MemoryStore::new());
    let a = LockCoordinator::with_owner(store.clone(), "a");
    let b = LockCoordinator::with_owner(store.clone(), "b");
    let lease = Duration::seconds(30);

    assert!(a.acquire_at("t1", ts(0), lease).unwrap());
    assert!(a.is_held_at("t1", ts(10)).unwrap());
    assert!(!b.acquire_at("t1", ts(10), lease).unwrap());

    // a stalls past its lease
    assert!(b.acquire_at("t1", ts(31), lease).unwrap());
    assert!(!a.is_held_at("t1", ts(32)).unwrap());
    a.release("t1").unwrap();
    assert!(b.is_held_at("t1", ts(32)).unwrap());
}

#[test]
fn coordinators_get_distinct_owners() {
    let store = Arc::new(MemoryStore::new());
    let a = LockCoordinator::new(store.clone());
    let b = LockCoordinator::new(store);
    assert_ne!(a.owner(), b.owner());
}

#[test]
fn store_outage_is_coordination_unavailable() {
    let store = Arc::new(MemoryStore::new());
    let locks = LockCoordinator::with_owner(store.clone(), "a");
    store.set_unavailable(true);
    let err = locks.acquire("t1", Duration::seconds(30)).unwrap_err();
    let LockError::CoordinationUnavailable { trigger_id, source } = err;
    assert_eq!(trigger_id, "t1");
    assert!(source.is_unavailable());
}

fn make_pool(store: &Arc<MemoryStore>, owner: &str) -> CheckerPool {
    CheckerPool::new(
        store.clone(),
        TriggerChecker::new(store.clone(), store.clone()),
        LockCoordinator::with_owner(store.clone(), owner),
        CheckerConfig {
            workers: 2,
            poll_interval: std::time::Duration::from_millis(10),
            ..CheckerConfig::default()
        },
    )
}

#[test]
fn pool_skips_trigger_leased_elsewhere() {
    let store = Arc::new(MemoryStore::new());
    store.save_trigger(&make_trigger("t1")).unwrap();
    let other = LockCoordinator::with_owner(store.clone(), "other");
    assert!(other.acquire("t1", Duration::seconds(300)).unwrap());

    let pool = make_pool(&store, "pool");
    store.add_trigger_to_check("t1").unwrap();
    assert!(pool.run_once().unwrap());
    assert!(store.get_last_check("t1").unwrap().is_none());
    assert!(other.is_held("t1").unwrap());

    other.release("t1").unwrap();
    store.add_trigger_to_check("t1").unwrap();
    assert!(pool.run_once().unwrap());
    assert!(store.get_last_check("t1").unwrap().is_some());
    // The pool released its own lease
    assert!(other.acquire("t1", Duration::seconds(30)).unwrap());
    assert!(!pool.run_once().unwrap());
}

#[tokio::test]
async fn pool_and_producer_stop_on_cancel() {
    let store = Arc::new(MemoryStore::new());
    store.save_trigger(&make_trigger("t1")).unwrap();
    store.save_trigger(&make_trigger("t2")).unwrap();
    let now = Utc::now();
    store
        .save_samples("db.load", &[Sample { timestamp: now, value: 95.0 }])
        .unwrap();

    let cancel = CancellationToken::new();
    let producer = CheckProducer::new(store.clone(), std::time::Duration::from_secs(60));
    let producer_task = tokio::spawn(producer.run(cancel.clone()));
    let pool_task = tokio::spawn(make_pool(&store, "pool").run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while store.get_last_check("t2").unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "triggers were not checked");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        producer_task.await.unwrap();
        pool_task.await.unwrap();
    })
    .await
    .expect("loops exit promptly after cancel");

    assert!(store.get_last_check("t1").unwrap().is_some());
    assert_eq!(store.get_events("t1", now - Duration::seconds(1), 10).unwrap().len(), 1);
}
