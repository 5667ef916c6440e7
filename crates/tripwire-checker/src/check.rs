use crate::error::EvaluationError;
use crate::state;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tripwire_common::id;
use tripwire_common::types::{Event, Sample, Trigger, TriggerState};
use tripwire_storage::error::Result;
use tripwire_storage::{MetricStore, TriggerStore};

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The trigger was deleted after it was queued.
    Missing,
    Checked {
        state: TriggerState,
        event: Option<Event>,
    },
}

/// Runs one evaluation cycle for a trigger: fetch, evaluate, emit, save.
///
/// The caller must hold the trigger's lease.
pub struct TriggerChecker {
    triggers: Arc<dyn TriggerStore>,
    metrics: Arc<dyn MetricStore>,
}

impl TriggerChecker {
    pub fn new(triggers: Arc<dyn TriggerStore>, metrics: Arc<dyn MetricStore>) -> Self {
        Self { triggers, metrics }
    }

    /// Evaluates `trigger_id` at `now`.
    ///
    /// The event and the new check result are committed together, so a
    /// failed cycle leaves no trace and the next one re-evaluates from the
    /// same last check.
    pub fn check(&self, trigger_id: &str, now: DateTime<Utc>) -> Result<CheckOutcome> {
        let Some(trigger) = self.triggers.get_trigger(trigger_id)? else {
            return Ok(CheckOutcome::Missing);
        };
        let last = self.triggers.get_last_check(trigger_id)?;

        let evaluation = match self.fetch(&trigger, now) {
            Ok(samples) => state::evaluate(&trigger, last.as_ref(), &samples, now),
            Err(e) => state::evaluate_error(&trigger, last.as_ref(), &e, now),
        };

        let event = evaluation.event(&trigger, id::next_id());
        self.triggers
            .record_check(trigger_id, &evaluation.check, event.as_ref())?;
        if let Some(event) = &event {
            info!(
                trigger_id,
                event_id = %event.id,
                old_state = %event.old_state,
                new_state = %event.new_state,
                reannounce = event.reannounce,
                "Trigger state event emitted"
            );
        }

        Ok(CheckOutcome::Checked {
            state: evaluation.check.state,
            event,
        })
    }

    fn fetch(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> std::result::Result<HashMap<String, Vec<Sample>>, EvaluationError> {
        if trigger.targets.is_empty() {
            return Ok(HashMap::new());
        }
        let mut retention = Duration::zero();
        for target in &trigger.targets {
            retention = retention.max(self.metrics.get_retention(target)?);
        }
        let (from, until) = state::fetch_window(trigger, retention, now);
        Ok(self.metrics.fetch_samples(&trigger.targets, from, until)?)
    }
}
