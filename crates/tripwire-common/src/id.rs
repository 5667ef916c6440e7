//! Process-wide snowflake ids for events.

use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, MutexGuard};

/// Machine and node ids each take five bits of a snowflake id.
pub const WORKER_ID_RANGE: std::ops::Range<i32> = 0..32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("Id: {field} {value} is outside 0..32")]
    OutOfRange { field: &'static str, value: i32 },
}

static ID_GENERATOR: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

fn generator() -> MutexGuard<'static, Option<SnowflakeIdBucket>> {
    ID_GENERATOR
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Checks that both ids fit the snowflake layout. Out-of-range ids would
/// be masked into another process's id space.
pub fn validate(machine_id: i32, node_id: i32) -> Result<(), IdError> {
    for (field, value) in [("machine_id", machine_id), ("node_id", node_id)] {
        if !WORKER_ID_RANGE.contains(&value) {
            return Err(IdError::OutOfRange { field, value });
        }
    }
    Ok(())
}

/// Installs the generator for this process. Every process of a fleet needs
/// its own `(machine_id, node_id)` pair or event ids may collide.
pub fn init(machine_id: i32, node_id: i32) -> Result<(), IdError> {
    validate(machine_id, node_id)?;
    *generator() = Some(SnowflakeIdBucket::new(machine_id, node_id));
    Ok(())
}

/// Next id in string form. Uses `(1, 1)` when [`init`] was never called.
pub fn next_id() -> String {
    let mut gen = generator();
    let bucket = gen.get_or_insert_with(|| SnowflakeIdBucket::new(1, 1));
    bucket.get_id().to_string()
}
