use crate::error::LockError;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use tripwire_common::id;
use tripwire_storage::LockStore;

/// Expiring per-trigger leases owned by one checker process.
///
/// The lease lives in the [`LockStore`], not in this process, so any number
/// of coordinators (in one process or many) sharing a store exclude each
/// other. A holder that dies simply stops renewing and its lease lapses.
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    owner: String,
}

impl LockCoordinator {
    /// Creates a coordinator with a fresh owner token.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        let owner = format!("{}-{}", std::process::id(), id::next_id());
        Self::with_owner(store, owner)
    }

    pub fn with_owner(store: Arc<dyn LockStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Takes the lease on `trigger_id` unless someone holds an unexpired one.
    pub fn acquire(&self, trigger_id: &str, lease: Duration) -> Result<bool, LockError> {
        self.acquire_at(trigger_id, Utc::now(), lease)
    }

    pub fn acquire_at(
        &self,
        trigger_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, LockError> {
        self.store
            .try_acquire_lock(trigger_id, &self.owner, now, lease)
            .map_err(|source| unavailable(trigger_id, source))
    }

    /// Drops the lease if this coordinator still holds it.
    pub fn release(&self, trigger_id: &str) -> Result<(), LockError> {
        let released = self
            .store
            .release_lock(trigger_id, &self.owner)
            .map_err(|source| unavailable(trigger_id, source))?;
        if !released {
            debug!(trigger_id, owner = %self.owner, "Lease was no longer held at release");
        }
        Ok(())
    }

    pub fn is_held(&self, trigger_id: &str) -> Result<bool, LockError> {
        self.is_held_at(trigger_id, Utc::now())
    }

    pub fn is_held_at(&self, trigger_id: &str, now: DateTime<Utc>) -> Result<bool, LockError> {
        let holder = self
            .store
            .lock_holder(trigger_id, now)
            .map_err(|source| unavailable(trigger_id, source))?;
        Ok(holder.as_deref() == Some(self.owner.as_str()))
    }
}

fn unavailable(trigger_id: &str, source: tripwire_storage::error::StorageError) -> LockError {
    LockError::CoordinationUnavailable {
        trigger_id: trigger_id.to_string(),
        source,
    }
}
