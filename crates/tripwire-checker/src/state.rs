//! The trigger state machine.
//!
//! [`evaluate`] is a pure function of the trigger, its last check, the
//! fetched samples and the evaluation time. Identical inputs always give an
//! identical [`Evaluation`], which is what lets any worker pick up any
//! trigger.

use crate::error::EvaluationError;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tripwire_common::types::{
    CheckResult, Event, MetricSnapshot, Sample, Trigger, TriggerState,
};

/// State assumed for a trigger that has never been checked.
pub const INITIAL_STATE: TriggerState = TriggerState::NoData;

/// An emitted state change, before it is given an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old_state: TriggerState,
    pub new_state: TriggerState,
    pub reannounce: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// The check result to persist, whether or not an event is emitted.
    pub check: CheckResult,
    /// Set when this cycle emits an event. `None` when the state is
    /// unchanged or a maintenance window suppressed the event.
    pub transition: Option<Transition>,
}

impl Evaluation {
    /// Builds the event for this cycle's transition, if there is one.
    pub fn event(&self, trigger: &Trigger, id: String) -> Option<Event> {
        let transition = self.transition?;
        let values = self
            .check
            .metrics
            .iter()
            .filter_map(|(metric, snapshot)| snapshot.value.map(|v| (metric.clone(), v)))
            .collect();
        Some(Event {
            id,
            trigger_id: trigger.id.clone(),
            old_state: transition.old_state,
            new_state: transition.new_state,
            timestamp: self.check.timestamp,
            values,
            message: self.check.message.clone(),
            trigger: trigger.snapshot(),
            reannounce: transition.reannounce,
        })
    }
}

/// Sample range needed to evaluate `trigger` at `now`: the no-data timeout
/// plus one retention step, so the newest sample inside the timeout is never
/// cut off by storage resolution.
pub fn fetch_window(
    trigger: &Trigger,
    retention: Duration,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (now - nodata_timeout(trigger) - retention, now)
}

pub fn evaluate(
    trigger: &Trigger,
    last: Option<&CheckResult>,
    samples: &HashMap<String, Vec<Sample>>,
    now: DateTime<Utc>,
) -> Evaluation {
    match compute_metrics(trigger, samples, now) {
        Ok(metrics) => {
            let state = metrics
                .values()
                .map(|m| m.state)
                .max()
                .unwrap_or(trigger.nodata_state);
            let message = describe(trigger, &metrics);
            transition(trigger, last, state, metrics, message, now)
        }
        Err(e) => evaluate_error(trigger, last, &e, now),
    }
}

/// Result of a cycle that could not evaluate the trigger. The last known
/// metric snapshots are kept so the check still shows the latest values.
pub fn evaluate_error(
    trigger: &Trigger,
    last: Option<&CheckResult>,
    error: &EvaluationError,
    now: DateTime<Utc>,
) -> Evaluation {
    let metrics = last.map(|l| l.metrics.clone()).unwrap_or_default();
    transition(
        trigger,
        last,
        TriggerState::Exception,
        metrics,
        error.to_string(),
        now,
    )
}

/// Longest configurable window, so window arithmetic cannot overflow.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

fn nodata_timeout(trigger: &Trigger) -> Duration {
    seconds(trigger.nodata_timeout_secs)
}

fn compute_metrics(
    trigger: &Trigger,
    samples: &HashMap<String, Vec<Sample>>,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, MetricSnapshot>, EvaluationError> {
    if trigger.targets.is_empty() {
        return Err(EvaluationError::NoTargets);
    }
    if let Some(bad) = trigger
        .conditions
        .iter()
        .find(|c| !matches!(c.state, TriggerState::Warn | TriggerState::Error))
    {
        return Err(EvaluationError::InvalidCondition(bad.state));
    }

    let oldest_current = now - nodata_timeout(trigger);
    let mut metrics = BTreeMap::new();
    for target in &trigger.targets {
        let current = samples
            .get(target)
            .into_iter()
            .flatten()
            .filter(|s| s.timestamp >= oldest_current && s.timestamp <= now)
            .max_by_key(|s| s.timestamp);

        let snapshot = match current {
            None => MetricSnapshot {
                state: trigger.nodata_state,
                value: None,
                timestamp: None,
            },
            Some(sample) => {
                if !sample.value.is_finite() {
                    return Err(EvaluationError::InvalidValue {
                        metric: target.clone(),
                        value: sample.value,
                    });
                }
                MetricSnapshot {
                    state: metric_state(trigger, sample.value),
                    value: Some(sample.value),
                    timestamp: Some(sample.timestamp),
                }
            }
        };
        metrics.insert(target.clone(), snapshot);
    }
    Ok(metrics)
}

/// ERROR conditions win over WARN conditions; otherwise the value is OK.
fn metric_state(trigger: &Trigger, value: f64) -> TriggerState {
    [TriggerState::Error, TriggerState::Warn]
        .into_iter()
        .find(|state| {
            trigger
                .conditions
                .iter()
                .any(|c| c.state == *state && c.matches(value))
        })
        .unwrap_or(TriggerState::Ok)
}

fn describe(trigger: &Trigger, metrics: &BTreeMap<String, MetricSnapshot>) -> String {
    metrics
        .iter()
        .filter(|(_, m)| !m.state.is_ok())
        .map(|(metric, m)| match m.value {
            Some(value) => {
                let matched = trigger
                    .conditions
                    .iter()
                    .find(|c| c.state == m.state && c.matches(value));
                match matched {
                    Some(c) => format!("{metric} = {value} ({} {} {})", m.state, c.operator, c.value),
                    None => format!("{metric} = {value} ({})", m.state),
                }
            }
            None => format!(
                "{metric}: no data for {}s ({})",
                trigger.nodata_timeout_secs, m.state
            ),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn transition(
    trigger: &Trigger,
    last: Option<&CheckResult>,
    state: TriggerState,
    metrics: BTreeMap<String, MetricSnapshot>,
    message: String,
    now: DateTime<Utc>,
) -> Evaluation {
    let old_state = last.map(|l| l.state).unwrap_or(INITIAL_STATE);
    let (changed, reannounce) = match last {
        // A first OK has nothing to recover from.
        None => (state != INITIAL_STATE && !state.is_ok(), false),
        Some(last) if last.state != state => (true, false),
        Some(last) => (false, !state.is_ok() && renotify_due(trigger, last, now)),
    };
    let emit = changed || reannounce;
    let suppressed = emit && in_maintenance(trigger, now);

    let event_timestamp = if emit && !suppressed {
        Some(now)
    } else {
        last.and_then(|l| l.event_timestamp)
    };

    Evaluation {
        check: CheckResult {
            state,
            timestamp: now,
            event_timestamp,
            metrics,
            message,
            suppressed,
        },
        transition: (emit && !suppressed).then_some(Transition {
            old_state,
            new_state: state,
            reannounce,
        }),
    }
}

fn renotify_due(trigger: &Trigger, last: &CheckResult, now: DateTime<Utc>) -> bool {
    let Some(secs) = trigger.renotify_interval_secs else {
        return false;
    };
    let since = last.event_timestamp.unwrap_or(last.timestamp);
    now - since >= seconds(secs)
}

fn in_maintenance(trigger: &Trigger, now: DateTime<Utc>) -> bool {
    trigger.in_maintenance(now)
        || trigger
            .targets
            .iter()
            .any(|target| trigger.metric_in_maintenance(target, now))
}
