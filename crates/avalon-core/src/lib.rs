//! Grain runtime for the Avalon economy engine.
//!
//! Each player owns one Inventory grain that holds a resource ledger and a
//! construction registry. Timer grains drive construction, generation and
//! transformation by publishing callbacks to the inventory's topics. An
//! Admin grain tracks liveness of both and coordinates shutdown.
//!
//! # Modules
//!
//! - [`config`] -- Engine configuration loaded from `avalon-config.yaml`.
//! - [`catalog`] -- Read-only building and resource blueprints.
//! - [`bus`] -- [`EventBus`] trait and the in-process [`InMemoryBus`].
//! - [`store`] -- [`SnapshotStore`] trait and the in-process [`InMemoryStore`].
//! - [`construction`] -- Building instances and the per-blueprint registry.
//! - [`snapshot`] -- Versioned binary inventory snapshots.
//! - [`timer`] -- The Timer grain and its three modes.
//! - [`inventory`] -- The Inventory grain.
//! - [`admin`] -- Liveness tracking and coordinated shutdown.
//! - [`directory`] -- Node-local grain handles and activation.
//!
//! [`EventBus`]: bus::EventBus
//! [`InMemoryBus`]: bus::InMemoryBus
//! [`SnapshotStore`]: store::SnapshotStore
//! [`InMemoryStore`]: store::InMemoryStore

pub mod admin;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod construction;
pub mod directory;
pub mod inventory;
mod liveness;
pub mod snapshot;
pub mod store;
pub mod timer;

pub use admin::{AdminError, AdminHandle, LivenessRecord, LivenessRegistry, ShutdownReport};
pub use bus::{BusError, BusStream, EventBus, InMemoryBus};
pub use catalog::{BlueprintCatalog, CatalogError};
pub use config::{ConfigError, EngineConfig};
pub use directory::{Directory, DirectoryShutdown, GrainContext};
pub use inventory::{InventoryError, InventoryHandle, InventoryView, StartedBuilding};
pub use snapshot::{InventorySnapshot, SnapshotError};
pub use store::{InMemoryStore, SnapshotStore, StoreError};
pub use timer::{TimerCreated, TimerError, TimerHandle, TimerRequest};
