pub mod log;
pub mod webhook;

use serde_json::{json, Value};
use tripwire_common::types::{Contact, Event, TriggerSnapshot};

/// The JSON document delivered for one package of events.
pub fn package(
    events: &[Event],
    contact: &Contact,
    trigger: &TriggerSnapshot,
    throttled: bool,
) -> Value {
    json!({
        "trigger": trigger,
        "contact": {
            "id": contact.id,
            "type": contact.contact_type,
            "value": contact.value,
        },
        "throttled": throttled,
        "events": events,
    })
}
