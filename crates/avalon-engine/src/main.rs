//! Node binary for the Avalon economy engine.
//!
//! Wires the grain directory to its infrastructure and serves until
//! interrupted. Players' inventories are activated on demand by whatever
//! front end shares this node's bus; on start the node re-activates every
//! inventory that has a stored snapshot.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration from `avalon-config.yaml`
//! 3. Load the blueprint catalog
//! 4. Connect the message bus (NATS or in-process)
//! 5. Connect the snapshot store (`PostgreSQL` or in-process)
//! 6. Create the grain directory
//! 7. Start the admin grain
//! 8. Restore persisted inventories
//! 9. Wait for Ctrl-C
//! 10. Persist through the admin and stop every grain

mod error;
mod nats_bus;

use std::path::PathBuf;
use std::sync::Arc;

use avalon_core::bus::{EventBus, InMemoryBus};
use avalon_core::config::{BusBackend, EngineConfig, StoreBackend};
use avalon_core::store::{InMemoryStore, SnapshotStore};
use avalon_core::{AdminHandle, BlueprintCatalog, Directory, GrainContext};
use avalon_db::{PgSnapshotStore, PostgresPool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::nats_bus::NatsBus;

const DEFAULT_CONFIG_PATH: &str = "avalon-config.yaml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("avalon-engine starting");
    run().await?;
    info!("avalon-engine shutdown complete");
    Ok(())
}

async fn run() -> Result<(), EngineError> {
    // 2. Load configuration.
    let config = load_config()?;
    info!(
        node = config.node.name,
        address = config.node.address,
        bus = ?config.infrastructure.bus,
        store = ?config.infrastructure.store,
        "Configuration loaded"
    );

    // 3. Load blueprints.
    let catalog = BlueprintCatalog::load(&config.blueprints.path)?;
    info!(
        path = %config.blueprints.path.display(),
        buildings = catalog.buildings().count(),
        resources = catalog.resources().count(),
        "Blueprint catalog loaded"
    );

    // 4. Message bus.
    let nats = match config.infrastructure.bus {
        BusBackend::Nats => Some(
            NatsBus::connect(&config.infrastructure.nats_url)
                .await
                .map_err(|e| EngineError::Nats {
                    message: format!("{e}"),
                })?,
        ),
        BusBackend::Memory => None,
    };
    let bus: Arc<dyn EventBus> = match &nats {
        Some(nats) => Arc::new(nats.clone()),
        None => {
            warn!("Using in-process bus, grains on other nodes are unreachable");
            Arc::new(InMemoryBus::new())
        }
    };

    // 5. Snapshot store.
    let (store, pool): (Arc<dyn SnapshotStore>, Option<PostgresPool>) =
        match config.infrastructure.store {
            StoreBackend::Postgres => {
                let pool = PostgresPool::connect(
                    &config.infrastructure.postgres_url,
                    config.infrastructure.postgres_max_connections,
                )
                .await?;
                pool.run_migrations().await?;
                (Arc::new(PgSnapshotStore::new(pool.clone())), Some(pool))
            }
            StoreBackend::Memory => {
                warn!("Using in-process snapshot store, state is lost on exit");
                (Arc::new(InMemoryStore::new()), None)
            }
        };

    // 6. Grain directory.
    let directory = Directory::new(GrainContext {
        bus: Arc::clone(&bus),
        store,
        catalog: Arc::new(catalog),
        node: config.node.clone(),
        liveness: config.liveness,
        inventory: config.inventory,
    });

    // 7. Admin grain.
    let admin = AdminHandle::start(bus.as_ref(), config.liveness).await?;

    // 8. Restore persisted inventories.
    if config.persistence.restore_on_start {
        let restored = directory.restore_all().await?;
        info!(restored, "Persisted inventories activated");
    }

    // 9. Serve until interrupted.
    info!("Node ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // 10. Persist and stop.
    if config.persistence.persist_on_shutdown {
        let report = admin.shutdown(&directory).await?;
        info!(
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            "Inventories persisted"
        );
    }
    let stopped = directory.shutdown(false).await;
    info!(
        inventories = stopped.inventories_stopped,
        timers = stopped.timers_stopped,
        "Grains stopped"
    );

    if let Some(nats) = nats {
        nats.flush().await;
    }
    if let Some(pool) = pool {
        pool.close().await;
    }
    Ok(())
}

/// Load configuration from `AVALON_CONFIG` or `avalon-config.yaml`.
///
/// A missing file falls back to defaults; environment overrides still
/// apply.
fn load_config() -> Result<EngineConfig, EngineError> {
    let config_path = std::env::var_os("AVALON_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if config_path.exists() {
        Ok(EngineConfig::from_file(&config_path)?)
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        let mut config = EngineConfig::default();
        config.infrastructure.apply_env_overrides();
        Ok(config)
    }
}
