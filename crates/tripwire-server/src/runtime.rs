use crate::config::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tripwire_checker::check::TriggerChecker;
use tripwire_checker::lock::LockCoordinator;
use tripwire_checker::worker::{CheckProducer, CheckerPool};
use tripwire_notify::delivery::DeliveryPool;
use tripwire_notify::notifier::Notifier;
use tripwire_notify::registry::SenderRegistry;
use tripwire_notify::scheduler::NotificationScheduler;
use tripwire_notify::subscription::SubscriptionResolver;
use tripwire_notify::throttling::ThrottlingPolicy;
use tripwire_storage::Store;

/// Runs the check producer, the checker pool, the notifier and the delivery
/// pool against `store` until `cancel` fires, then waits for all of them to
/// finish their current unit of work.
pub async fn run<S: Store + 'static>(
    store: Arc<S>,
    config: &Config,
    senders: SenderRegistry,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let checker_config = config.checker.to_checker_config();

    let producer = CheckProducer::new(store.clone(), checker_config.check_interval);
    let checker = TriggerChecker::new(store.clone(), store.clone());
    let locks = LockCoordinator::new(store.clone());
    info!(owner = %locks.owner(), "Lease owner assigned");
    let pool = CheckerPool::new(store.clone(), checker, locks, checker_config);

    let notifier = Notifier::new(
        store.clone(),
        SubscriptionResolver::new(store.clone()),
        ThrottlingPolicy::new(store.clone(), config.throttling.to_throttling_config()),
        NotificationScheduler::new(store.clone()),
        config.notifier.to_notifier_config(),
    );
    let delivery = DeliveryPool::new(
        store.clone(),
        Arc::new(senders),
        config.delivery.to_delivery_config(),
    );

    let tasks = [
        ("check producer", tokio::spawn(producer.run(cancel.clone()))),
        ("checker pool", tokio::spawn(pool.run(cancel.clone()))),
        ("notifier", tokio::spawn(notifier.run(cancel.clone()))),
        ("delivery pool", tokio::spawn(delivery.run(cancel.clone()))),
    ];

    let mut failed = Vec::new();
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Engine task failed");
            failed.push(name);
        }
    }
    if !failed.is_empty() {
        anyhow::bail!("engine tasks failed: {}", failed.join(", "));
    }
    info!("Engine stopped");
    Ok(())
}
