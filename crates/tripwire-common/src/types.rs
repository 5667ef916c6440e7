use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Health state of a trigger, ordered from least to most severe.
///
/// The ordering is used to combine per-metric states into the trigger
/// state: the most severe metric wins.
///
/// # Examples
///
/// ```
/// use tripwire_common::types::TriggerState;
///
/// let state: TriggerState = "error".parse().unwrap();
/// assert_eq!(state, TriggerState::Error);
/// assert_eq!(state.to_string(), "ERROR");
/// assert!(TriggerState::Error > TriggerState::Warn);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerState {
    Ok,
    Warn,
    Error,
    NoData,
    Exception,
}

impl TriggerState {
    pub fn is_ok(self) -> bool {
        self == TriggerState::Ok
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerState::Ok => write!(f, "OK"),
            TriggerState::Warn => write!(f, "WARN"),
            TriggerState::Error => write!(f, "ERROR"),
            TriggerState::NoData => write!(f, "NODATA"),
            TriggerState::Exception => write!(f, "EXCEPTION"),
        }
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OK" => Ok(TriggerState::Ok),
            "WARN" | "WARNING" => Ok(TriggerState::Warn),
            "ERROR" => Ok(TriggerState::Error),
            "NODATA" => Ok(TriggerState::NoData),
            "EXCEPTION" => Ok(TriggerState::Exception),
            _ => Err(format!("unknown trigger state: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "lt")]
    LessThan,
    #[serde(alias = "gte")]
    GreaterEqual,
    #[serde(alias = "lte")]
    LessEqual,
}

impl std::str::FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greater_than" | "gt" => Ok(Self::GreaterThan),
            "less_than" | "lt" => Ok(Self::LessThan),
            "greater_equal" | "gte" => Ok(Self::GreaterEqual),
            "less_equal" | "lte" => Ok(Self::LessEqual),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::LessThan => write!(f, "<"),
            Self::GreaterEqual => write!(f, ">="),
            Self::LessEqual => write!(f, "<="),
        }
    }
}

impl CompareOp {
    pub fn check(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
        }
    }
}

/// A threshold that moves a metric into `state` when `value <op> threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub state: TriggerState,
    pub operator: CompareOp,
    pub value: f64,
}

impl Condition {
    pub fn matches(&self, value: f64) -> bool {
        self.operator.check(value, self.value)
    }
}

/// A user-defined alerting rule over one or more metric targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    pub targets: Vec<String>,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Seconds without a sample after which a target counts as NODATA.
    #[serde(default = "default_nodata_timeout_secs")]
    pub nodata_timeout_secs: u64,
    /// State reported when every target is without data.
    #[serde(default = "default_nodata_state")]
    pub nodata_state: TriggerState,
    /// Re-announce an unchanged non-OK state once this many seconds have
    /// passed since the last event.
    #[serde(default)]
    pub renotify_interval_secs: Option<u64>,
    #[serde(default)]
    pub maintenance_until: Option<DateTime<Utc>>,
    /// Per-metric maintenance deadlines.
    #[serde(default)]
    pub metric_maintenance: BTreeMap<String, DateTime<Utc>>,
}

fn default_nodata_timeout_secs() -> u64 {
    600
}

fn default_nodata_state() -> TriggerState {
    TriggerState::NoData
}

impl Trigger {
    pub fn snapshot(&self) -> TriggerSnapshot {
        TriggerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn in_maintenance(&self, now: DateTime<Utc>) -> bool {
        self.maintenance_until.is_some_and(|until| until > now)
    }

    pub fn metric_in_maintenance(&self, metric: &str, now: DateTime<Utc>) -> bool {
        self.metric_maintenance
            .get(metric)
            .is_some_and(|until| *until > now)
    }
}

/// The part of a trigger carried along with events and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub state: TriggerState,
    pub value: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// The last computed state of a trigger. Overwritten every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub state: TriggerState,
    pub timestamp: DateTime<Utc>,
    /// When the last event for this trigger was emitted.
    pub event_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSnapshot>,
    #[serde(default)]
    pub message: String,
    /// Set when a maintenance window swallowed this cycle's event.
    #[serde(default)]
    pub suppressed: bool,
}

/// An immutable record of a trigger state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub trigger_id: String,
    pub old_state: TriggerState,
    pub new_state: TriggerState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub message: String,
    pub trigger: TriggerSnapshot,
    /// True when the state is unchanged and the event re-announces it.
    #[serde(default)]
    pub reannounce: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlingRecord {
    pub next_allowed: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    /// Consecutive escalations; the throttling interval doubles with each.
    pub level: u32,
}

/// What to do with a contact that is inside its quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuietHoursPolicy {
    /// Hold the notification until quiet hours end.
    #[default]
    Defer,
    /// Do not notify this contact for the event at all.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub tags: BTreeSet<String>,
    pub contacts: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub throttling_enabled: bool,
    #[serde(default)]
    pub quiet_hours_policy: QuietHoursPolicy,
}

fn default_true() -> bool {
    true
}

impl Subscription {
    /// A subscription matches when its tag filter is a non-empty subset of
    /// the trigger's tags.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::BTreeSet;
    /// use tripwire_common::types::Subscription;
    ///
    /// let sub = Subscription {
    ///     id: "s1".into(),
    ///     owner: "ops".into(),
    ///     tags: BTreeSet::from(["db".to_string()]),
    ///     contacts: vec!["c1".into()],
    ///     enabled: true,
    ///     throttling_enabled: true,
    ///     quiet_hours_policy: Default::default(),
    /// };
    /// let trigger_tags = BTreeSet::from(["db".to_string(), "prod".to_string()]);
    /// assert!(sub.matches(&trigger_tags));
    /// assert!(!sub.matches(&BTreeSet::from(["web".to_string()])));
    /// ```
    pub fn matches(&self, trigger_tags: &BTreeSet<String>) -> bool {
        !self.tags.is_empty() && self.tags.is_subset(trigger_tags)
    }
}

/// A daily window of local wall-clock time during which a contact should
/// not be disturbed. `start > end` describes an overnight window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// The contact's time zone as an offset from UTC, strictly inside
    /// ±24 hours.
    #[serde(default, deserialize_with = "deserialize_utc_offset")]
    pub utc_offset_minutes: i32,
}

fn deserialize_utc_offset<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let minutes = i32::deserialize(deserializer)?;
    if minutes.unsigned_abs() >= 24 * 60 {
        return Err(serde::de::Error::custom(format!(
            "utc_offset_minutes {minutes} is outside -1439..=1439"
        )));
    }
    Ok(minutes)
}

impl QuietHours {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).unwrap_or(Utc.fix())
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset()).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// The instant the current quiet window ends, or `None` when quiet hours
    /// are not active at `now`.
    pub fn active_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_active(now) {
            return None;
        }
        let offset = self.offset();
        let local = now.with_timezone(&offset);
        let mut end_date = local.date_naive();
        if self.start > self.end && local.time() >= self.start {
            end_date = end_date.succ_opt()?;
        }
        offset
            .from_local_datetime(&end_date.and_time(self.end))
            .single()
            .map(|end| end.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    /// Sender key, e.g. `"webhook"`.
    #[serde(rename = "type")]
    pub contact_type: String,
    /// Channel address (URL, mailbox, phone number).
    pub value: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

/// A durable intent to deliver one event to one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub event: Event,
    pub contact: Contact,
    pub trigger: TriggerSnapshot,
    pub due_at: DateTime<Utc>,
    pub throttled: bool,
    /// Delivery attempts already made.
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl ScheduledNotification {
    pub fn key(&self) -> String {
        notification_key(&self.event.id, &self.contact.id)
    }
}

/// Identity of a scheduled notification: one per (event, contact) pair.
pub fn notification_key(event_id: &str, contact_id: &str) -> String {
    format!("{event_id}:{contact_id}")
}

/// Audit record for a notification that will never be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonedNotification {
    pub notification: ScheduledNotification,
    pub reason: String,
    pub attempts: u32,
    pub abandoned_at: DateTime<Utc>,
}
