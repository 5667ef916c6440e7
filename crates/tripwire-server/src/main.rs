use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tripwire_notify::registry::SenderRegistry;
use tripwire_server::config::{Config, StorageBackend};
use tripwire_server::{runtime, seed};
use tripwire_storage::memory::MemoryStore;
use tripwire_storage::sqlite::SqliteStore;
use tripwire_storage::{NotificationStore, Store};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  tripwire-server [config.toml]                        Start the engine");
    eprintln!("  tripwire-server seed <config.toml> <seed.json>       Load triggers, contacts and subscriptions");
    eprintln!("  tripwire-server abandoned <config.toml> [limit]      List abandoned notifications");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tripwire=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("seed") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("seed requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("seed requires <seed.json> argument")
            })?;
            run_seed(config_path, seed_path)
        }
        Some("abandoned") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("abandoned requires <config.toml> argument")
            })?;
            let limit = match args.get(3) {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid limit '{raw}': {e}"))?,
                None => 50,
            };
            run_abandoned(config_path, limit)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/tripwire.toml");
            run_server(config_path).await
        }
    }
}

fn open_sqlite(config: &Config) -> Result<SqliteStore> {
    if config.storage.backend == StorageBackend::Memory {
        anyhow::bail!("the memory backend does not persist; point storage.backend at sqlite");
    }
    Ok(SqliteStore::open(Path::new(&config.storage.path))?)
}

fn run_seed(config_path: &str, seed_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = open_sqlite(&config)?;
    let seed = seed::SeedFile::load(seed_path)?;
    let report = seed::apply(&store, &seed)?;
    tracing::info!(
        triggers_created = report.triggers_created,
        triggers_skipped = report.triggers_skipped,
        contacts_created = report.contacts_created,
        contacts_skipped = report.contacts_skipped,
        subscriptions_saved = report.subscriptions_saved,
        "Seed applied"
    );
    Ok(())
}

fn run_abandoned(config_path: &str, limit: usize) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = open_sqlite(&config)?;
    let abandoned = store.list_abandoned(limit)?;
    for record in &abandoned {
        tracing::info!(
            key = %record.notification.key(),
            contact_id = %record.notification.contact.id,
            trigger_id = %record.notification.trigger.id,
            attempts = record.attempts,
            reason = %record.reason,
            abandoned_at = %record.abandoned_at,
            "Abandoned notification"
        );
    }
    tracing::info!(count = abandoned.len(), "Abandoned notifications listed");
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = Config::load(config_path)?;
    tripwire_common::id::init(config.id.machine_id, config.id.node_id)?;

    let senders = SenderRegistry::from_config(&config.senders).await?;
    if senders.contact_types().is_empty() {
        tracing::warn!("No senders configured, every notification will be abandoned");
    }

    match config.storage.backend {
        StorageBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(Path::new(&config.storage.path))?);
            serve(store, &config, senders).await
        }
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store, state is lost on shutdown");
            serve(Arc::new(MemoryStore::new()), &config, senders).await
        }
    }
}

async fn serve<S: Store + 'static>(
    store: Arc<S>,
    config: &Config,
    senders: SenderRegistry,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received, finishing in-flight work");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    tracing::info!(backend = ?config.storage.backend, "Starting tripwire engine");
    runtime::run(store, config, senders, cancel).await
}
