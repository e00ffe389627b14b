//! Inventory grain: the per-player economy orchestrator.
//!
//! One inventory owns one [`ResourceLedger`] and one
//! [`ConstructionRegistry`], and drives them from a single message loop.
//! Player-facing requests (`StartBuilding`, `Reserve`, `Describe`,
//! `Persist`, `Restore`) and bus callbacks (building completions, generator
//! and transformer fires, timer stop notices) are all serialized through
//! that loop, so the ledger and the registry need no locks.
//!
//! # Callback idempotency
//!
//! The bus delivers at least once. Every [`TimerFired`] carries a per-timer
//! sequence number and the grain ignores sequences it has already applied.
//! A building completion is additionally applied only while the instance
//! is still queued and only for the timer that was armed for it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use avalon_ledger::{LedgerEntry, LedgerError, ResourceLedger};
use avalon_types::events::{payload_flag, payload_str, payload_u64};
use avalon_types::{
    BlueprintId, BuildingBlueprint, BuildingId, BuildingState, BuildingName, GrainKind,
    InventoryId, Payload, ResourceName, TimerFired, TimerId, TimerKind, TimerStopped,
    TransformerCost, TransformerResult, UpdateKind, keys, topics,
};

use crate::bus::{BusStream, decode_event};
use crate::catalog::BlueprintCatalog;
use crate::construction::{BuildingInstance, ConstructionError, ConstructionRegistry};
use crate::directory::Directory;
use crate::liveness::{announce, spawn_ticker};
use crate::snapshot::{InventorySnapshot, SnapshotError};
use crate::store::StoreError;
use crate::timer::{TimerCreated, TimerError, TimerRequest};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by inventory operations.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// No blueprint with this name.
    #[error("unknown building: {name}")]
    UnknownBuilding {
        /// Requested name.
        name: String,
    },

    /// A cost references a resource the ledger does not track.
    #[error("unknown resource: {resource}")]
    UnknownResource {
        /// The missing resource.
        resource: ResourceName,
    },

    /// The construction cost cannot be covered.
    #[error("insufficient resources: {resources:?}")]
    InsufficientResources {
        /// Every resource that was short.
        resources: Vec<ResourceName>,
    },

    /// Another building is already queued.
    #[error("build slot occupied")]
    SlotOccupied,

    /// A transformer input reservation was refused.
    #[error("reservation failed: {source}")]
    ReservationFailed {
        /// The ledger's reason.
        source: LedgerError,
    },

    /// Snapshot bytes could not be turned back into state.
    #[error("failed to decode snapshot: {source}")]
    SnapshotDecode {
        /// The decode error.
        source: SnapshotError,
    },

    /// State could not be serialized.
    #[error("failed to encode snapshot: {source}")]
    SnapshotEncode {
        /// The encode error.
        source: SnapshotError,
    },

    /// The construction timer could not be created.
    #[error("failed to create timer: {source}")]
    TimerCreation {
        /// The timer error.
        source: TimerError,
    },

    /// The snapshot store failed.
    #[error("snapshot store failed: {source}")]
    Store {
        /// The store error.
        #[from]
        source: StoreError,
    },

    /// The timer asking for a reservation is not owned by this inventory.
    #[error("timer {timer_id} is not tracked by this inventory")]
    UnknownTimer {
        /// The untracked timer.
        timer_id: TimerId,
    },

    /// The grain is not running.
    #[error("inventory unavailable")]
    Unavailable,
}

impl From<LedgerError> for InventoryError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::UnknownResource { resource } => Self::UnknownResource { resource },
            LedgerError::InsufficientResources { resources } => {
                Self::InsufficientResources { resources }
            }
            source @ LedgerError::Formula { .. } => Self::ReservationFailed { source },
        }
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Acknowledgement of a started construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartedBuilding {
    /// The queued instance.
    pub building_id: BuildingId,
    /// Its blueprint.
    pub blueprint_id: BlueprintId,
    /// The timer driving construction.
    pub timer_id: TimerId,
    /// When construction completes.
    pub completion_time: DateTime<Utc>,
}

/// One building register in a [`InventoryView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildingView {
    /// Blueprint id.
    pub blueprint_id: BlueprintId,
    /// Blueprint name.
    pub name: BuildingName,
    /// Active instances.
    pub completed: Vec<BuildingInstance>,
    /// Queued instances.
    pub queued: Vec<BuildingInstance>,
}

/// One ledger entry in a [`InventoryView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceView {
    /// Resource name.
    pub name: ResourceName,
    /// Spendable amount.
    pub amount: u64,
    /// Reserved amount.
    pub reserved: u64,
    /// Cap, zero when uncapped.
    pub cap: u64,
}

/// Read-only projection of an inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryView {
    /// Inventory id.
    pub inventory_id: InventoryId,
    /// Building registers.
    pub buildings: Vec<BuildingView>,
    /// Ledger entries.
    pub resources: Vec<ResourceView>,
    /// Outstanding timers, when requested.
    pub timers: Option<Vec<TimerId>>,
}

impl InventoryView {
    /// Ledger entry by name.
    pub fn resource(&self, name: &str) -> Option<&ResourceView> {
        self.resources.iter().find(|r| r.name.as_str() == name)
    }

    /// Register by building name, case-insensitively.
    pub fn building(&self, name: &str) -> Option<&BuildingView> {
        let key = name.to_lowercase();
        self.buildings.iter().find(|b| b.name.key() == key)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum InventoryMessage {
    StartBuilding {
        name: String,
        disable_generators: bool,
        reply: oneshot::Sender<Result<StartedBuilding, InventoryError>>,
    },
    Reserve {
        resources: BTreeMap<ResourceName, u64>,
        reply: oneshot::Sender<Result<(), InventoryError>>,
    },
    ReserveInputs {
        timer_id: TimerId,
        resources: BTreeMap<ResourceName, u64>,
        reply: oneshot::Sender<Result<(), InventoryError>>,
    },
    Describe {
        include_timers: bool,
        reply: oneshot::Sender<InventoryView>,
    },
    Persist {
        reply: oneshot::Sender<Result<Vec<u8>, InventoryError>>,
    },
    Restore {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), InventoryError>>,
    },
    Stop {
        persist: bool,
        reply: oneshot::Sender<Result<(), InventoryError>>,
    },
    BuildingFired(TimerFired),
    ResourceFired(TimerFired),
    TransformFired(TimerFired),
    TimerStopped(TimerStopped),
    Heartbeat,
}

/// Cloneable address of a running inventory.
#[derive(Debug, Clone)]
pub struct InventoryHandle {
    inventory_id: InventoryId,
    tx: mpsc::Sender<InventoryMessage>,
}

impl InventoryHandle {
    /// Id of the addressed inventory.
    pub const fn inventory_id(&self) -> InventoryId {
        self.inventory_id
    }

    /// Whether the grain loop has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> InventoryMessage,
    ) -> Result<T, InventoryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_closed| InventoryError::Unavailable)?;
        rx.await.map_err(|_closed| InventoryError::Unavailable)
    }

    /// Start constructing `name`. Returns once the construction timer
    /// exists, not when it fires.
    ///
    /// `disable_generators` skips starting generators and transformers on
    /// completion.
    pub async fn start_building(
        &self,
        name: &str,
        disable_generators: bool,
    ) -> Result<StartedBuilding, InventoryError> {
        let name = name.to_owned();
        self.request(|reply| InventoryMessage::StartBuilding {
            name,
            disable_generators,
            reply,
        })
        .await?
    }

    /// All-or-nothing reservation of `resources`.
    pub async fn reserve(
        &self,
        resources: BTreeMap<ResourceName, u64>,
    ) -> Result<(), InventoryError> {
        self.request(|reply| InventoryMessage::Reserve { resources, reply })
            .await?
    }

    /// Reserve the inputs of one transformer tick of `timer_id`.
    ///
    /// The reservation stays in flight until the tick's fire is settled;
    /// snapshots taken meanwhile hand the inputs back.
    pub(crate) async fn reserve_inputs(
        &self,
        timer_id: TimerId,
        resources: BTreeMap<ResourceName, u64>,
    ) -> Result<(), InventoryError> {
        self.request(|reply| InventoryMessage::ReserveInputs {
            timer_id,
            resources,
            reply,
        })
        .await?
    }

    /// Read-only view of buildings and resources.
    pub async fn describe(&self, include_timers: bool) -> Result<InventoryView, InventoryError> {
        self.request(|reply| InventoryMessage::Describe {
            include_timers,
            reply,
        })
        .await
    }

    /// Write a snapshot to the store and return its bytes.
    pub async fn persist(&self) -> Result<Vec<u8>, InventoryError> {
        self.request(|reply| InventoryMessage::Persist { reply }).await?
    }

    /// Replace the grain's state with a snapshot.
    ///
    /// Running timers are stopped; generators and transformers of active
    /// buildings are recreated and queued constructions re-armed.
    pub async fn restore(&self, bytes: Vec<u8>) -> Result<(), InventoryError> {
        self.request(|reply| InventoryMessage::Restore { bytes, reply })
            .await?
    }

    /// Stop the grain, persisting first when `persist` is set.
    pub async fn stop(&self, persist: bool) -> Result<(), InventoryError> {
        self.request(|reply| InventoryMessage::Stop { persist, reply })
            .await?
    }
}

/// Spawn the grain for `id` and return its handle.
pub(crate) fn activate(id: InventoryId, directory: Arc<Directory>) -> InventoryHandle {
    let capacity = directory.context().inventory.mailbox_capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let mailbox = tx.downgrade();
    tokio::spawn(async move {
        let grain = InventoryGrain::activate(id, directory, mailbox).await;
        grain.run(rx).await;
    });
    InventoryHandle {
        inventory_id: id,
        tx,
    }
}

// ---------------------------------------------------------------------------
// Grain
// ---------------------------------------------------------------------------

struct InventoryGrain {
    id: InventoryId,
    directory: Arc<Directory>,
    catalog: Arc<BlueprintCatalog>,
    registry: ConstructionRegistry,
    ledger: ResourceLedger,
    timers: BTreeSet<TimerId>,
    applied: HashMap<TimerId, u64>,
    /// Transformer inputs reserved for ticks whose fire is not settled yet.
    in_flight: HashMap<TimerId, VecDeque<BTreeMap<ResourceName, u64>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl InventoryGrain {
    async fn activate(
        id: InventoryId,
        directory: Arc<Directory>,
        mailbox: mpsc::WeakSender<InventoryMessage>,
    ) -> Self {
        let catalog = Arc::clone(&directory.context().catalog);
        let heartbeat = directory.context().liveness.heartbeat_interval();
        let mut grain = Self {
            id,
            directory,
            catalog,
            registry: ConstructionRegistry::default(),
            ledger: ResourceLedger::new(),
            timers: BTreeSet::new(),
            applied: HashMap::new(),
            in_flight: HashMap::new(),
            tasks: Vec::new(),
        };

        grain.subscribe(&mailbox).await;

        let restored = match grain.load_snapshot().await {
            Some(snapshot) => match grain.adopt(&snapshot) {
                Ok(()) => true,
                Err(e) => {
                    warn!(inventory_id = %id, error = %e, "snapshot restore failed, starting cold");
                    false
                }
            },
            None => false,
        };
        if !restored {
            grain.cold_start();
        }

        grain.announce(UpdateKind::Register).await;
        grain
            .tasks
            .push(spawn_ticker(mailbox, heartbeat, || InventoryMessage::Heartbeat));
        info!(inventory_id = %id, restored, "inventory activated");
        grain
    }

    async fn run(mut self, mut rx: mpsc::Receiver<InventoryMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                InventoryMessage::StartBuilding {
                    name,
                    disable_generators,
                    reply,
                } => {
                    let _ = reply.send(self.start_building(&name, disable_generators));
                }
                InventoryMessage::Reserve { resources, reply } => {
                    let result = self.ledger.reserve(&resources).map_err(InventoryError::from);
                    let _ = reply.send(result);
                }
                InventoryMessage::ReserveInputs {
                    timer_id,
                    resources,
                    reply,
                } => {
                    let _ = reply.send(self.reserve_inputs(timer_id, resources));
                }
                InventoryMessage::Describe {
                    include_timers,
                    reply,
                } => {
                    let _ = reply.send(self.describe(include_timers));
                }
                InventoryMessage::Persist { reply } => {
                    let _ = reply.send(self.persist().await);
                }
                InventoryMessage::Restore { bytes, reply } => {
                    let result = InventorySnapshot::decode(&bytes)
                        .map_err(|source| InventoryError::SnapshotDecode { source })
                        .and_then(|snapshot| self.adopt(&snapshot));
                    let _ = reply.send(result);
                }
                InventoryMessage::Stop { persist, reply } => {
                    let result = if persist {
                        self.persist().await.map(|_| ())
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(result);
                    break;
                }
                InventoryMessage::BuildingFired(event) => self.on_building_fired(&event),
                InventoryMessage::ResourceFired(event) => self.on_resource_fired(&event),
                InventoryMessage::TransformFired(event) => self.on_transform_fired(&event),
                InventoryMessage::TimerStopped(event) => self.on_timer_stopped(&event),
                InventoryMessage::Heartbeat => self.announce(UpdateKind::Heartbeat).await,
            }
        }

        self.stop_timers();
        for task in &self.tasks {
            task.abort();
        }
        self.announce(UpdateKind::Deregister).await;
        info!(inventory_id = %self.id, "inventory deactivated");
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    async fn subscribe(&mut self, mailbox: &mpsc::WeakSender<InventoryMessage>) {
        let bus = Arc::clone(&self.directory.context().bus);
        let routes: [(String, fn(TimerFired) -> InventoryMessage); 3] = [
            (
                topics::building_callbacks(self.id),
                InventoryMessage::BuildingFired,
            ),
            (
                topics::resource_callbacks(self.id),
                InventoryMessage::ResourceFired,
            ),
            (
                topics::transform_callbacks(self.id),
                InventoryMessage::TransformFired,
            ),
        ];

        for (topic, wrap) in routes {
            match bus.subscribe(&topic).await {
                Ok(stream) => self
                    .tasks
                    .push(forward(stream, topic, mailbox.clone(), wrap)),
                Err(e) => warn!(inventory_id = %self.id, %topic, error = %e, "subscribe failed"),
            }
        }

        match bus.subscribe(topics::TIMER_STATUS).await {
            Ok(stream) => self.tasks.push(forward(
                stream,
                topics::TIMER_STATUS.to_owned(),
                mailbox.clone(),
                InventoryMessage::TimerStopped,
            )),
            Err(e) => warn!(inventory_id = %self.id, error = %e, "subscribe to timer status failed"),
        }
    }

    async fn load_snapshot(&self) -> Option<InventorySnapshot> {
        let store = Arc::clone(&self.directory.context().store);
        match store.latest(GrainKind::Inventory, self.id.into_inner()).await {
            Ok(Some(bytes)) => match InventorySnapshot::decode(&bytes) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(inventory_id = %self.id, error = %e, "discarding undecodable snapshot");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(inventory_id = %self.id, error = %e, "snapshot lookup failed");
                None
            }
        }
    }

    fn cold_start(&mut self) {
        self.stop_timers();
        self.registry = ConstructionRegistry::starting(&self.catalog, Utc::now());
        self.ledger = ResourceLedger::new();
        self.merge_catalog();
        self.recompute_caps();
        self.resume();
        debug!(inventory_id = %self.id, "inventory started cold");
    }

    /// Replace state with `snapshot`, then bring timers back.
    fn adopt(&mut self, snapshot: &InventorySnapshot) -> Result<(), InventoryError> {
        let ledger = snapshot
            .ledger()
            .map_err(|source| InventoryError::SnapshotDecode { source })?;
        if snapshot.inventory_id != self.id {
            warn!(
                inventory_id = %self.id,
                snapshot_id = %snapshot.inventory_id,
                "adopting snapshot of another inventory"
            );
        }

        self.stop_timers();
        self.registry = snapshot.registry();
        self.ledger = ledger;
        self.merge_catalog();
        self.resume();
        self.recompute_caps();
        info!(
            inventory_id = %self.id,
            buildings = self.registry.active().count(),
            queued = self.registry.queued_count(),
            "inventory restored"
        );
        Ok(())
    }

    /// Add registers and ledger entries for blueprints the state lacks.
    fn merge_catalog(&mut self) {
        for blueprint in self.catalog.buildings() {
            self.registry.ensure_register(blueprint);
        }
        for resource in self.catalog.resources() {
            let name = &resource.blueprint.name;
            if self.ledger.get(name).is_none() {
                self.ledger.insert(
                    LedgerEntry::new(
                        name.clone(),
                        resource.blueprint.starting_amount,
                        resource.blueprint.starting_cap,
                    )
                    .with_formula(resource.formula.clone()),
                );
            }
        }
    }

    /// Start production for active buildings and re-arm queued ones.
    fn resume(&mut self) {
        let active: Vec<BuildingId> = self.registry.active().map(|b| b.id).collect();
        for building_id in active {
            self.start_production(building_id);
        }

        let queued: Vec<BuildingInstance> = self.registry.queued().cloned().collect();
        for instance in queued {
            self.rearm_construction(&instance);
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn start_building(
        &mut self,
        name: &str,
        disable_generators: bool,
    ) -> Result<StartedBuilding, InventoryError> {
        let catalog = Arc::clone(&self.catalog);
        let blueprint = catalog
            .building(name)
            .ok_or_else(|| InventoryError::UnknownBuilding {
                name: name.to_owned(),
            })?;

        if self.registry.queued_count() > 0 {
            return Err(InventoryError::SlotOccupied);
        }

        let costs = cost_map(blueprint.cost.iter().map(|c| (&c.resource, c.amount)));
        self.ledger.reserve(&costs)?;

        let now = Utc::now();
        let mut instance = BuildingInstance::queued(blueprint, now);
        let payload = building_payload(instance.id, &blueprint.name, disable_generators);
        let created = match self.spawn_timer(
            TimerKind::Building,
            topics::building_callbacks(self.id),
            blueprint.build_time(),
            0,
            payload,
            Some(now),
        ) {
            Ok(created) => created,
            Err(source) => {
                self.rollback(&costs);
                return Err(InventoryError::TimerCreation { source });
            }
        };

        instance.building_timer_id = Some(created.timer_id);
        instance.completion_time = created.deadline;
        let started = StartedBuilding {
            building_id: instance.id,
            blueprint_id: instance.blueprint_id,
            timer_id: created.timer_id,
            completion_time: created.deadline,
        };

        if let Err(e) = self.registry.enqueue(instance) {
            self.forget_timer(created.timer_id);
            self.rollback(&costs);
            return Err(match e {
                ConstructionError::SlotOccupied => InventoryError::SlotOccupied,
                ConstructionError::UnknownBlueprint(_) => InventoryError::UnknownBuilding {
                    name: name.to_owned(),
                },
            });
        }

        info!(
            inventory_id = %self.id,
            building = %blueprint.name,
            building_id = %started.building_id,
            completion_time = %started.completion_time,
            "construction started"
        );
        Ok(started)
    }

    fn reserve_inputs(
        &mut self,
        timer_id: TimerId,
        resources: BTreeMap<ResourceName, u64>,
    ) -> Result<(), InventoryError> {
        if !self.timers.contains(&timer_id) {
            return Err(InventoryError::UnknownTimer { timer_id });
        }
        self.ledger
            .reserve(&resources)
            .map_err(|source| InventoryError::ReservationFailed { source })?;
        self.in_flight.entry(timer_id).or_default().push_back(resources);
        Ok(())
    }

    fn describe(&self, include_timers: bool) -> InventoryView {
        InventoryView {
            inventory_id: self.id,
            buildings: self
                .registry
                .registers()
                .map(|r| BuildingView {
                    blueprint_id: r.blueprint_id,
                    name: r.name.clone(),
                    completed: r.completed.values().cloned().collect(),
                    queued: r.queue.values().cloned().collect(),
                })
                .collect(),
            resources: self
                .ledger
                .entries()
                .map(|e| ResourceView {
                    name: e.name.clone(),
                    amount: e.amount,
                    reserved: e.reserved,
                    cap: e.cap,
                })
                .collect(),
            timers: include_timers.then(|| self.timers.iter().copied().collect()),
        }
    }

    async fn persist(&self) -> Result<Vec<u8>, InventoryError> {
        // Unsettled transformer ticks are not part of durable state.
        let mut ledger = self.ledger.clone();
        for batch in self.in_flight.values().flatten() {
            release_batch(&mut ledger, batch);
        }
        let bytes = InventorySnapshot::capture(self.id, &self.registry, &ledger, &self.timers)
            .encode()
            .map_err(|source| InventoryError::SnapshotEncode { source })?;
        self.directory
            .context()
            .store
            .insert(GrainKind::Inventory, self.id.into_inner(), bytes.clone())
            .await?;
        info!(inventory_id = %self.id, bytes = bytes.len(), "inventory persisted");
        Ok(bytes)
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    /// Record `event` as applied. `false` for duplicates.
    fn first_delivery(&mut self, event: &TimerFired) -> bool {
        let last = self.applied.entry(event.timer_id).or_insert(0);
        if event.sequence <= *last {
            debug!(
                inventory_id = %self.id,
                timer_id = %event.timer_id,
                sequence = event.sequence,
                "duplicate delivery ignored"
            );
            return false;
        }
        *last = event.sequence;
        true
    }

    fn owns_timer(&self, event: &TimerFired) -> bool {
        let owned = self.timers.contains(&event.timer_id);
        if !owned {
            debug!(inventory_id = %self.id, timer_id = %event.timer_id, "event from untracked timer");
        }
        owned
    }

    fn on_building_fired(&mut self, event: &TimerFired) {
        let Some(building_id) = payload_str(&event.payload, keys::ID)
            .and_then(|raw| raw.parse::<BuildingId>().ok())
        else {
            warn!(inventory_id = %self.id, timer_id = %event.timer_id, "building callback without id");
            return;
        };

        let Some(instance) = self.registry.instance(building_id) else {
            warn!(inventory_id = %self.id, %building_id, "building callback for unknown instance");
            return;
        };
        if instance.state != BuildingState::Queued {
            debug!(inventory_id = %self.id, %building_id, "building already completed");
            return;
        }
        if instance.building_timer_id != Some(event.timer_id) {
            warn!(
                inventory_id = %self.id,
                %building_id,
                timer_id = %event.timer_id,
                "building callback from a timer not armed for this instance"
            );
            return;
        }
        let blueprint_id = instance.blueprint_id;
        if !self.first_delivery(event) {
            return;
        }

        let Some(done) = self.registry.complete(blueprint_id, building_id, Utc::now()) else {
            return;
        };
        let costs = std::mem::take(&mut done.reserved_costs);
        let name = done.name.clone();

        for cost in &costs {
            if let Err(e) = self.ledger.release(&cost.resource, cost.amount, cost.permanent) {
                warn!(inventory_id = %self.id, error = %e, "failed to settle construction cost");
            }
        }
        if !payload_flag(&event.payload, keys::DISABLE_GENERATORS) {
            self.start_production(building_id);
        }
        self.recompute_caps();

        info!(inventory_id = %self.id, building = %name, %building_id, "construction completed");
    }

    fn on_resource_fired(&mut self, event: &TimerFired) {
        if !self.owns_timer(event) || !self.first_delivery(event) {
            return;
        }
        let (Some(resource), Some(amount)) = (
            payload_str(&event.payload, keys::RESOURCE),
            payload_u64(&event.payload, keys::AMOUNT),
        ) else {
            warn!(inventory_id = %self.id, timer_id = %event.timer_id, "malformed generator payload");
            return;
        };
        if let Err(e) = self.ledger.generate(&ResourceName::from(resource), amount) {
            warn!(inventory_id = %self.id, resource, error = %e, "generation failed");
        }
    }

    fn on_transform_fired(&mut self, event: &TimerFired) {
        if !self.owns_timer(event) || !self.first_delivery(event) {
            return;
        }
        if let Some(pending) = self.in_flight.get_mut(&event.timer_id) {
            pending.pop_front();
        }
        let costs: Vec<TransformerCost> = payload_list(&event.payload, keys::COST);
        let results: Vec<TransformerResult> = payload_list(&event.payload, keys::RESULT);
        if let Err(e) = self.ledger.settle_transform(&results, &costs) {
            warn!(inventory_id = %self.id, timer_id = %event.timer_id, error = %e, "transform settlement failed");
        }
    }

    fn on_timer_stopped(&mut self, event: &TimerStopped) {
        if event.inventory_id != self.id {
            return;
        }
        if self.timers.remove(&event.timer_id) {
            self.applied.remove(&event.timer_id);
            self.release_in_flight(event.timer_id);
            debug!(inventory_id = %self.id, timer_id = %event.timer_id, "timer stopped");
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn spawn_timer(
        &mut self,
        kind: TimerKind,
        reply_topic: String,
        interval: core::time::Duration,
        repeat_count: i64,
        payload: Payload,
        start: Option<DateTime<Utc>>,
    ) -> Result<TimerCreated, TimerError> {
        let created = self.directory.spawn_timer(TimerRequest {
            timer_id: TimerId::new(),
            kind,
            inventory_id: self.id,
            reply_topic,
            interval,
            repeat_count,
            payload,
            start,
        })?;
        self.timers.insert(created.timer_id);
        Ok(created)
    }

    fn forget_timer(&mut self, timer_id: TimerId) {
        self.directory.stop_timer(timer_id);
        self.timers.remove(&timer_id);
        self.applied.remove(&timer_id);
        self.release_in_flight(timer_id);
    }

    fn stop_timers(&mut self) {
        for timer_id in std::mem::take(&mut self.timers) {
            self.directory.stop_timer(timer_id);
            self.release_in_flight(timer_id);
        }
        self.applied.clear();
    }

    /// Hand back inputs reserved by ticks of `timer_id` that will never be
    /// settled, since fires from untracked timers are ignored.
    fn release_in_flight(&mut self, timer_id: TimerId) {
        for batch in self.in_flight.remove(&timer_id).unwrap_or_default() {
            release_batch(&mut self.ledger, &batch);
        }
    }

    /// Start one timer per generator and transformer of an active building.
    fn start_production(&mut self, building_id: BuildingId) {
        let catalog = Arc::clone(&self.catalog);
        let Some(blueprint) = self
            .registry
            .instance(building_id)
            .and_then(|b| catalog.building_by_id(b.blueprint_id))
        else {
            warn!(inventory_id = %self.id, %building_id, "no blueprint for building");
            return;
        };

        let mut generator_ids = Vec::with_capacity(blueprint.generates.len());
        for generator in &blueprint.generates {
            match self.spawn_timer(
                TimerKind::Generator,
                topics::resource_callbacks(self.id),
                generator.tick_length(),
                -1,
                generator_payload(building_id, blueprint, generator),
                None,
            ) {
                Ok(created) => generator_ids.push(created.timer_id),
                Err(e) => warn!(inventory_id = %self.id, %building_id, error = %e, "generator not started"),
            }
        }

        let mut transformer_ids = Vec::with_capacity(blueprint.transforms.len());
        for transformer in &blueprint.transforms {
            match self.spawn_timer(
                TimerKind::Transformer,
                topics::transform_callbacks(self.id),
                transformer.tick_length(),
                -1,
                transformer_payload(building_id, blueprint, transformer),
                None,
            ) {
                Ok(created) => transformer_ids.push(created.timer_id),
                Err(e) => warn!(inventory_id = %self.id, %building_id, error = %e, "transformer not started"),
            }
        }

        if let Some(instance) = self.registry.instance_mut(building_id) {
            instance.generator_timer_ids = generator_ids;
            instance.transformer_timer_ids = transformer_ids;
        }
    }

    /// Give a restored queued instance a fresh timer due at its original
    /// completion time.
    fn rearm_construction(&mut self, instance: &BuildingInstance) {
        let catalog = Arc::clone(&self.catalog);
        let build_time = catalog
            .building_by_id(instance.blueprint_id)
            .map(BuildingBlueprint::build_time)
            .unwrap_or_default();
        let start = chrono::Duration::from_std(build_time)
            .ok()
            .and_then(|d| instance.completion_time.checked_sub_signed(d))
            .unwrap_or(instance.completion_time);

        let payload = building_payload(instance.id, &instance.name, false);
        match self.spawn_timer(
            TimerKind::Building,
            topics::building_callbacks(self.id),
            build_time,
            0,
            payload,
            Some(start),
        ) {
            Ok(created) => {
                if let Some(queued) = self.registry.instance_mut(instance.id) {
                    queued.building_timer_id = Some(created.timer_id);
                }
                debug!(inventory_id = %self.id, building_id = %instance.id, deadline = %created.deadline, "construction re-armed");
            }
            Err(e) => warn!(inventory_id = %self.id, building_id = %instance.id, error = %e, "construction not re-armed"),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn rollback(&mut self, costs: &BTreeMap<ResourceName, u64>) {
        release_batch(&mut self.ledger, costs);
    }

    fn recompute_caps(&mut self) {
        if let Err(e) = self.ledger.recompute_caps(&self.registry.completed_counts()) {
            warn!(inventory_id = %self.id, error = %e, "cap recomputation incomplete");
        }
    }

    async fn announce(&self, update_kind: UpdateKind) {
        let context = BTreeMap::from([
            (
                "buildings".to_owned(),
                self.registry.active().count().to_string(),
            ),
            ("queued".to_owned(), self.registry.queued_count().to_string()),
            ("timers".to_owned(), self.timers.len().to_string()),
        ]);
        let ctx = self.directory.context();
        announce(
            ctx.bus.as_ref(),
            update_kind,
            GrainKind::Inventory,
            self.id.into_inner(),
            &ctx.node.address,
            context,
        )
        .await;
    }
}

/// Pump one subscription into the grain's mailbox.
fn forward<E: DeserializeOwned + Send + 'static>(
    mut stream: BusStream,
    topic: String,
    mailbox: mpsc::WeakSender<InventoryMessage>,
    wrap: fn(E) -> InventoryMessage,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = stream.next().await {
            let Some(event) = decode_event::<E>(&topic, &bytes) else {
                continue;
            };
            let Some(tx) = mailbox.upgrade() else { break };
            if tx.send(wrap(event)).await.is_err() {
                break;
            }
        }
    })
}

fn release_batch(ledger: &mut ResourceLedger, batch: &BTreeMap<ResourceName, u64>) {
    for (resource, amount) in batch {
        if let Err(e) = ledger.release(resource, *amount, false) {
            warn!(%resource, error = %e, "failed to release in-flight reservation");
        }
    }
}

/// Sum cost lines per resource.
fn cost_map<'a>(lines: impl IntoIterator<Item = (&'a ResourceName, u64)>) -> BTreeMap<ResourceName, u64> {
    let mut map = BTreeMap::new();
    for (resource, amount) in lines {
        let total: &mut u64 = map.entry(resource.clone()).or_default();
        *total = total.saturating_add(amount);
    }
    map
}

fn payload_list<T: DeserializeOwned>(payload: &Payload, key: &str) -> Vec<T> {
    payload
        .get(key)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

fn building_payload(building_id: BuildingId, name: &BuildingName, disable_generators: bool) -> Payload {
    let mut payload = Payload::new();
    payload.insert(keys::ID.to_owned(), Value::from(building_id.to_string()));
    payload.insert(keys::BUILDING.to_owned(), Value::from(name.as_str()));
    payload.insert(
        keys::DISABLE_GENERATORS.to_owned(),
        Value::from(disable_generators),
    );
    payload
}

fn generator_payload(
    building_id: BuildingId,
    blueprint: &BuildingBlueprint,
    generator: &avalon_types::Generator,
) -> Payload {
    let mut payload = Payload::new();
    payload.insert(keys::ID.to_owned(), Value::from(building_id.to_string()));
    payload.insert(keys::BUILDING.to_owned(), Value::from(blueprint.name.as_str()));
    payload.insert(
        keys::RESOURCE.to_owned(),
        Value::from(generator.resource.as_str()),
    );
    payload.insert(keys::AMOUNT.to_owned(), Value::from(generator.amount));
    payload
}

fn transformer_payload(
    building_id: BuildingId,
    blueprint: &BuildingBlueprint,
    transformer: &avalon_types::Transformer,
) -> Payload {
    let mut payload = Payload::new();
    payload.insert(keys::ID.to_owned(), Value::from(building_id.to_string()));
    payload.insert(keys::BUILDING.to_owned(), Value::from(blueprint.name.as_str()));
    payload.insert(
        keys::TRANSFORMER.to_owned(),
        Value::from(transformer.name.as_str()),
    );
    payload.insert(
        keys::COST.to_owned(),
        serde_json::to_value(&transformer.cost).unwrap_or_default(),
    );
    payload.insert(
        keys::RESULT.to_owned(),
        serde_json::to_value(&transformer.result).unwrap_or_default(),
    );
    payload
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_inventory_errors() {
        let wood = ResourceName::from("Wood");
        assert!(matches!(
            InventoryError::from(LedgerError::UnknownResource {
                resource: wood.clone()
            }),
            InventoryError::UnknownResource { .. }
        ));
        assert!(matches!(
            InventoryError::from(LedgerError::InsufficientResources {
                resources: vec![wood]
            }),
            InventoryError::InsufficientResources { .. }
        ));
    }

    #[test]
    fn cost_map_sums_duplicate_lines() {
        let wood = ResourceName::from("Wood");
        let stone = ResourceName::from("Stone");
        let map = cost_map([(&wood, 5), (&stone, 1), (&wood, 7)]);
        assert_eq!(map.get(&wood), Some(&12));
        assert_eq!(map.get(&stone), Some(&1));
    }

    #[test]
    fn transformer_payload_carries_costs_and_results() {
        let blueprint: BuildingBlueprint = serde_json::from_value(serde_json::json!({
            "name": "lumberyard",
            "transforms": [{
                "name": "planks",
                "cost": [{"resource": "Wood", "amount": 2, "temporary": false}],
                "result": [{"resource": "Planks", "amount": 1}],
                "tick_length_ms": 1000
            }]
        }))
        .unwrap();
        let payload = transformer_payload(BuildingId::new(), &blueprint, &blueprint.transforms[0]);

        let costs: Vec<TransformerCost> = payload_list(&payload, keys::COST);
        let results: Vec<TransformerResult> = payload_list(&payload, keys::RESULT);
        assert_eq!(costs, blueprint.transforms[0].cost);
        assert_eq!(results, blueprint.transforms[0].result);
        assert_eq!(payload_str(&payload, keys::TRANSFORMER), Some("planks"));
    }

    #[test]
    fn building_payload_round_trips_id() {
        let id = BuildingId::new();
        let payload = building_payload(id, &BuildingName::from("house"), true);
        assert_eq!(
            payload_str(&payload, keys::ID).and_then(|s| s.parse::<BuildingId>().ok()),
            Some(id)
        );
        assert!(payload_flag(&payload, keys::DISABLE_GENERATORS));
    }

    const MILL: &str = r"
- name: mill
  initial_amount: 1
  transforms:
    - name: flour
      cost:
        - resource: Grain
          amount: 1
      result:
        - resource: Flour
          amount: 1
      tick_length_ms: 1000
";

    const STAPLES: &str = r"
- name: Wood
  starting_amount: 20
- name: Grain
  starting_amount: 10
- name: Flour
  starting_amount: 0
";

    fn mill_directory() -> Arc<Directory> {
        use crate::bus::InMemoryBus;
        use crate::config::{InventoryConfig, LivenessConfig, NodeConfig};
        use crate::directory::GrainContext;
        use crate::store::InMemoryStore;

        Directory::new(GrainContext {
            bus: Arc::new(InMemoryBus::new()),
            store: Arc::new(InMemoryStore::new()),
            catalog: Arc::new(BlueprintCatalog::from_yaml(MILL, STAPLES).unwrap()),
            node: NodeConfig::default(),
            liveness: LivenessConfig::default(),
            inventory: InventoryConfig::default(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_transformer_inputs_stay_out_of_snapshots() {
        let directory = mill_directory();
        let inventory = directory.inventory(InventoryId::new());
        let view = inventory.describe(false).await.unwrap();
        let timer_id = view.building("mill").unwrap().completed[0].transformer_timer_ids[0];
        let wood = ResourceName::from("Wood");
        let inputs = BTreeMap::from([(wood.clone(), 5)]);

        inventory.reserve_inputs(timer_id, inputs.clone()).await.unwrap();
        let live = inventory.describe(false).await.unwrap();
        assert_eq!(live.resource("Wood").unwrap().reserved, 5);

        let bytes = inventory.persist().await.unwrap();
        let ledger = InventorySnapshot::decode(&bytes).unwrap().ledger().unwrap();
        let entry = ledger.get(&wood).unwrap();
        assert_eq!((entry.amount, entry.reserved), (20, 0));

        // Live state keeps the reservation until the tick settles.
        let live = inventory.describe(false).await.unwrap();
        assert_eq!(live.resource("Wood").unwrap().reserved, 5);

        inventory.restore(bytes).await.unwrap();
        let restored = inventory.describe(false).await.unwrap();
        assert_eq!(restored.resource("Wood").unwrap().amount, 20);
        assert_eq!(restored.resource("Wood").unwrap().reserved, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_timers_cannot_reserve_inputs() {
        let directory = mill_directory();
        let inventory = directory.inventory(InventoryId::new());
        let inputs = BTreeMap::from([(ResourceName::from("Wood"), 1)]);

        assert!(matches!(
            inventory.reserve_inputs(TimerId::new(), inputs).await,
            Err(InventoryError::UnknownTimer { .. })
        ));
        let view = inventory.describe(false).await.unwrap();
        assert_eq!(view.resource("Wood").unwrap().reserved, 0);
    }
}
