//! Grain directory: "give me a callable handle for grain kind K, identity I".
//!
//! The directory owns the node-wide [`GrainContext`] and the handles of
//! every locally hosted grain. It is passed explicitly (as an `Arc`) to each
//! grain that needs to reach others; there is no global cluster handle.
//! Inventories are activated on first use. Timers register themselves here
//! when spawned and are pruned once their loop has exited.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use avalon_types::{GrainKind, InventoryId, ResourceName, TimerId};

use crate::bus::EventBus;
use crate::catalog::BlueprintCatalog;
use crate::config::{InventoryConfig, LivenessConfig, NodeConfig};
use crate::inventory::{self, InventoryError, InventoryHandle};
use crate::store::{SnapshotStore, StoreError};
use crate::timer::{
    self, ReservationGate, TimerContext, TimerCreated, TimerError, TimerHandle, TimerRequest,
};

/// Shared collaborators every grain on this node uses.
#[derive(Clone)]
pub struct GrainContext {
    /// Message bus.
    pub bus: Arc<dyn EventBus>,
    /// Snapshot store.
    pub store: Arc<dyn SnapshotStore>,
    /// Read-only blueprint catalog.
    pub catalog: Arc<BlueprintCatalog>,
    /// This node's identity.
    pub node: NodeConfig,
    /// Heartbeat timing.
    pub liveness: LivenessConfig,
    /// Inventory tuning.
    pub inventory: InventoryConfig,
}

impl core::fmt::Debug for GrainContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GrainContext")
            .field("node", &self.node)
            .field("liveness", &self.liveness)
            .field("inventory", &self.inventory)
            .finish_non_exhaustive()
    }
}

/// Summary of a directory shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryShutdown {
    /// Inventories that stopped cleanly.
    pub inventories_stopped: usize,
    /// Inventories whose stop or persist failed.
    pub inventories_failed: usize,
    /// Timers asked to stop.
    pub timers_stopped: usize,
}

/// Handles of every grain hosted on this node.
#[derive(Debug)]
pub struct Directory {
    context: GrainContext,
    inventories: Mutex<HashMap<InventoryId, InventoryHandle>>,
    timers: Mutex<HashMap<TimerId, TimerHandle>>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new(context: GrainContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            inventories: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Node-wide collaborators.
    pub const fn context(&self) -> &GrainContext {
        &self.context
    }

    // -----------------------------------------------------------------------
    // Inventories
    // -----------------------------------------------------------------------

    /// Handle to the inventory `id`, activating it if it is not running.
    ///
    /// Activation restores the latest snapshot, or starts cold when there
    /// is none. Messages sent right away queue until activation finishes.
    pub fn inventory(self: &Arc<Self>, id: InventoryId) -> InventoryHandle {
        let mut inventories = self
            .inventories
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = inventories.get(&id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let handle = inventory::activate(id, Arc::clone(self));
        inventories.insert(id, handle.clone());
        handle
    }

    /// Handle to the inventory `id` only if it is already running.
    pub fn active_inventory(&self, id: InventoryId) -> Option<InventoryHandle> {
        self.inventories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Activate every inventory that has a stored snapshot.
    pub async fn restore_all(self: &Arc<Self>) -> Result<usize, StoreError> {
        let identities = self
            .context
            .store
            .identities(GrainKind::Inventory)
            .await?;
        let count = identities.len();
        for identity in identities {
            self.inventory(InventoryId::from(identity));
        }
        info!(count, "restored inventories from snapshots");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Start a timer and track its handle.
    pub fn spawn_timer(
        self: &Arc<Self>,
        request: TimerRequest,
    ) -> Result<TimerCreated, TimerError> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.retain(|_, h| !h.is_terminated());
        if timers.contains_key(&request.timer_id) {
            return Err(TimerError::AlreadyStarted(request.timer_id));
        }

        let ctx = TimerContext {
            bus: Arc::clone(&self.context.bus),
            gate: Arc::clone(self) as Arc<dyn ReservationGate>,
            address: self.context.node.address.clone(),
            liveness: self.context.liveness,
        };
        let (handle, created) = timer::start(request, ctx)?;
        timers.insert(created.timer_id, handle);
        Ok(created)
    }

    /// Handle to a running timer.
    pub fn timer(&self, id: TimerId) -> Option<TimerHandle> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .filter(|h| !h.is_terminated())
            .cloned()
    }

    /// Ask a timer to exit and forget it.
    pub fn stop_timer(&self, id: TimerId) {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(handle) = removed {
            handle.stop();
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop every inventory (persisting when asked), then every timer.
    pub async fn shutdown(&self, persist: bool) -> DirectoryShutdown {
        let inventories: Vec<InventoryHandle> = self
            .inventories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();

        let mut report = DirectoryShutdown::default();
        for handle in inventories {
            match handle.stop(persist).await {
                Ok(()) => report.inventories_stopped = report.inventories_stopped.saturating_add(1),
                Err(e) => {
                    warn!(inventory_id = %handle.inventory_id(), error = %e, "inventory stop failed");
                    report.inventories_failed = report.inventories_failed.saturating_add(1);
                }
            }
        }

        let timers: Vec<TimerHandle> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in &timers {
            handle.stop();
        }
        report.timers_stopped = timers.len();

        info!(
            inventories = report.inventories_stopped,
            failed = report.inventories_failed,
            timers = report.timers_stopped,
            "directory shut down"
        );
        report
    }
}

#[async_trait]
impl ReservationGate for Directory {
    async fn reserve(
        &self,
        timer_id: TimerId,
        inventory: InventoryId,
        resources: BTreeMap<ResourceName, u64>,
    ) -> Result<(), InventoryError> {
        let handle = self
            .active_inventory(inventory)
            .ok_or(InventoryError::Unavailable)?;
        handle.reserve_inputs(timer_id, resources).await
    }
}
