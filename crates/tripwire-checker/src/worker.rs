use crate::check::{CheckOutcome, TriggerChecker};
use crate::lock::LockCoordinator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tripwire_storage::error::{Result, StorageError};
use tripwire_storage::TriggerStore;

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub workers: usize,
    pub check_interval: Duration,
    /// Must comfortably exceed the time one check takes.
    pub lock_lease: chrono::Duration,
    pub poll_interval: Duration,
    /// Pause after a failure that left the store unreachable.
    pub error_backoff: Duration,
}

impl CheckerConfig {
    /// How long a worker waits after a failed check. An unreachable store
    /// gets the longer backoff; any other failure only affects that one
    /// trigger, so the worker goes back to polling.
    pub fn retry_delay(&self, err: &StorageError) -> Duration {
        if err.is_unavailable() {
            self.error_backoff
        } else {
            self.poll_interval
        }
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            check_interval: Duration::from_secs(60),
            lock_lease: chrono::Duration::seconds(30),
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Sleeps for `duration` and returns `false`, or returns `true` as soon as
/// `cancel` fires.
pub(crate) async fn wait_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Puts every trigger on the check queue once per interval.
pub struct CheckProducer {
    triggers: Arc<dyn TriggerStore>,
    interval: Duration,
}

impl CheckProducer {
    pub fn new(triggers: Arc<dyn TriggerStore>, interval: Duration) -> Self {
        Self { triggers, interval }
    }

    /// Enqueues all known triggers and returns how many there were.
    pub fn enqueue_all(&self) -> Result<usize> {
        let ids = self.triggers.list_trigger_ids()?;
        for id in &ids {
            self.triggers.add_trigger_to_check(id)?;
        }
        Ok(ids.len())
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Check producer started");
        loop {
            match self.enqueue_all() {
                Ok(count) => debug!(count, "Triggers enqueued for check"),
                Err(e) => warn!(error = %e, "Failed to enqueue triggers"),
            }
            if wait_or_cancel(&cancel, self.interval).await {
                break;
            }
        }
        info!("Check producer stopped");
    }
}

/// Workers draining the check queue under per-trigger leases.
pub struct CheckerPool {
    triggers: Arc<dyn TriggerStore>,
    checker: TriggerChecker,
    locks: LockCoordinator,
    config: CheckerConfig,
}

impl CheckerPool {
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        checker: TriggerChecker,
        locks: LockCoordinator,
        config: CheckerConfig,
    ) -> Self {
        Self {
            triggers,
            checker,
            locks,
            config,
        }
    }

    /// Pops and checks one trigger. Returns `false` when the queue is empty.
    ///
    /// A trigger whose lease is held elsewhere, or whose lease store cannot
    /// be reached, is skipped; the producer queues it again next interval.
    pub fn run_once(&self) -> Result<bool> {
        let Some(trigger_id) = self.triggers.pop_trigger_to_check()? else {
            return Ok(false);
        };

        match self.locks.acquire(&trigger_id, self.config.lock_lease) {
            Ok(true) => {}
            Ok(false) => {
                debug!(trigger_id = %trigger_id, "Trigger is being checked elsewhere, skipping");
                return Ok(true);
            }
            Err(e) => {
                warn!(trigger_id = %trigger_id, error = %e, "Skipping trigger check");
                return Ok(true);
            }
        }

        let result = self.checker.check(&trigger_id, Utc::now());
        if let Err(e) = self.locks.release(&trigger_id) {
            warn!(trigger_id = %trigger_id, error = %e, "Failed to release trigger lease");
        }

        match result? {
            CheckOutcome::Missing => {
                debug!(trigger_id = %trigger_id, "Trigger no longer exists, skipping");
            }
            CheckOutcome::Checked { state, event } => {
                debug!(
                    trigger_id = %trigger_id,
                    state = %state,
                    emitted = event.is_some(),
                    "Trigger checked"
                );
            }
        }
        Ok(true)
    }

    /// Runs `workers` concurrent check loops until `cancel` fires. A check
    /// in flight always completes before its loop exits.
    pub async fn run(self, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(workers, "Checker pool started");
        let pool = Arc::new(self);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let pool = pool.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.worker_loop(worker, cancel).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Checker worker task failed");
            }
        }
        info!("Checker pool stopped");
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let wait = match self.run_once() {
                Ok(true) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(false) => self.config.poll_interval,
                Err(e) => {
                    error!(worker, error = %e, "Trigger check failed");
                    self.config.retry_delay(&e)
                }
            };
            if wait_or_cancel(&cancel, wait).await {
                break;
            }
        }
        debug!(worker, "Checker worker stopped");
    }
}
