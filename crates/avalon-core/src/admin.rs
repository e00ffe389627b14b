//! Admin grain: cluster liveness tracking and coordinated shutdown.
//!
//! Every grain announces itself on [`topics::GRAIN_LIVENESS`] when it
//! activates, periodically while alive, and once more when it exits. The
//! admin keeps one [`LivenessRecord`] per grain and a gauge of active
//! grains per kind. A periodic sweep flags records whose last heartbeat is
//! older than the staleness window. Each sweep that finds a record stale
//! adds a toleration, and once a record reaches the configured maximum the
//! admin escalates with an error log. Nothing is evicted automatically.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use avalon_types::{GrainKind, GrainUpdate, InventoryId, UpdateKind, topics};

use crate::bus::{BusError, EventBus, decode_event};
use crate::config::LivenessConfig;
use crate::directory::Directory;
use crate::liveness::spawn_ticker;

const MAILBOX_CAPACITY: usize = 256;

/// Errors surfaced by the admin grain.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// The liveness topic could not be subscribed.
    #[error("failed to subscribe to liveness updates: {0}")]
    Bus(#[from] BusError),

    /// The admin loop has exited.
    #[error("admin unavailable")]
    Unavailable,
}

/// What the admin knows about one grain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessRecord {
    /// Grain identity.
    pub identity: Uuid,
    /// Grain kind.
    pub kind: GrainKind,
    /// Node address the grain reported.
    pub address: String,
    /// Timestamp of the latest update.
    pub last_seen: DateTime<Utc>,
    /// Consecutive sweeps that found the record stale.
    pub tolerations: u32,
    /// Free-form status reported with the latest update.
    pub context: BTreeMap<String, String>,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records found stale on this sweep.
    pub stale: Vec<Uuid>,
    /// Stale records that reached the toleration limit.
    pub escalated: Vec<Uuid>,
}

/// Liveness bookkeeping, free of any I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessRegistry {
    inventories: BTreeMap<Uuid, LivenessRecord>,
    timers: BTreeMap<Uuid, LivenessRecord>,
}

impl LivenessRegistry {
    /// Empty registry.
    pub const fn new() -> Self {
        Self {
            inventories: BTreeMap::new(),
            timers: BTreeMap::new(),
        }
    }

    const fn records_mut(&mut self, kind: GrainKind) -> &mut BTreeMap<Uuid, LivenessRecord> {
        match kind {
            GrainKind::Inventory => &mut self.inventories,
            GrainKind::Timer => &mut self.timers,
        }
    }

    /// Records of one kind.
    pub const fn records(&self, kind: GrainKind) -> &BTreeMap<Uuid, LivenessRecord> {
        match kind {
            GrainKind::Inventory => &self.inventories,
            GrainKind::Timer => &self.timers,
        }
    }

    /// Active-grain gauge for one kind.
    pub fn active(&self, kind: GrainKind) -> usize {
        self.records(kind).len()
    }

    /// Apply one liveness update.
    pub fn apply(&mut self, update: GrainUpdate) {
        let GrainUpdate {
            update_kind,
            grain_kind,
            identity,
            address,
            timestamp,
            context,
        } = update;
        let record = LivenessRecord {
            identity,
            kind: grain_kind,
            address,
            last_seen: timestamp,
            tolerations: 0,
            context,
        };

        let records = self.records_mut(grain_kind);
        match update_kind {
            UpdateKind::Register => {
                records.insert(identity, record);
                info!(kind = %grain_kind, %identity, active = records.len(), "grain registered");
            }
            UpdateKind::Heartbeat => {
                if records.insert(identity, record).is_none() {
                    warn!(
                        kind = %grain_kind,
                        %identity,
                        active = records.len(),
                        "heartbeat from unregistered grain, tracking it"
                    );
                }
            }
            UpdateKind::Deregister => {
                if records.remove(&identity).is_some() {
                    info!(kind = %grain_kind, %identity, active = records.len(), "grain deregistered");
                } else {
                    warn!(kind = %grain_kind, %identity, "deregister for unknown grain");
                }
            }
        }
    }

    /// Flag records older than `stale_after` as of `now`.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
        max_tolerations: u32,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        for record in self.inventories.values_mut().chain(self.timers.values_mut()) {
            let age = now.signed_duration_since(record.last_seen);
            if age <= stale_after {
                continue;
            }
            record.tolerations = record.tolerations.saturating_add(1);
            report.stale.push(record.identity);
            warn!(
                kind = %record.kind,
                identity = %record.identity,
                tolerations = record.tolerations,
                age_secs = age.num_seconds(),
                "stale grain heartbeat"
            );
            if record.tolerations >= max_tolerations {
                error!(
                    kind = %record.kind,
                    identity = %record.identity,
                    address = %record.address,
                    tolerations = record.tolerations,
                    age_secs = age.num_seconds(),
                    "grain unresponsive"
                );
                report.escalated.push(record.identity);
            }
        }
        report
    }
}

/// Result of [`AdminHandle::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Inventories persisted.
    pub persisted: Vec<InventoryId>,
    /// Inventories whose persist failed.
    pub failed: Vec<InventoryId>,
    /// Tracked inventories not running on this node.
    pub missing: Vec<InventoryId>,
}

enum AdminMessage {
    Update(GrainUpdate),
    Sweep,
    Describe(oneshot::Sender<LivenessRegistry>),
    Stop(oneshot::Sender<LivenessRegistry>),
}

/// Cloneable address of the admin grain.
#[derive(Debug, Clone)]
pub struct AdminHandle {
    tx: mpsc::Sender<AdminMessage>,
}

impl AdminHandle {
    /// Subscribe to liveness updates and start sweeping.
    pub async fn start(bus: &dyn EventBus, config: LivenessConfig) -> Result<Self, AdminError> {
        let mut updates = bus.subscribe(topics::GRAIN_LIVENESS).await?;
        let (tx, mut rx) = mpsc::channel(MAILBOX_CAPACITY);

        let mailbox = tx.downgrade();
        let forwarder = tokio::spawn(async move {
            while let Some(bytes) = updates.next().await {
                let Some(update) = decode_event::<GrainUpdate>(topics::GRAIN_LIVENESS, &bytes)
                else {
                    continue;
                };
                let Some(tx) = mailbox.upgrade() else { break };
                if tx.send(AdminMessage::Update(update)).await.is_err() {
                    break;
                }
            }
        });
        let sweeper = spawn_ticker(tx.downgrade(), config.sweep_interval(), || AdminMessage::Sweep);

        tokio::spawn(async move {
            let tasks: [JoinHandle<()>; 2] = [forwarder, sweeper];
            let stale_after =
                chrono::Duration::from_std(config.stale_after()).unwrap_or(chrono::Duration::MAX);
            let mut registry = LivenessRegistry::new();

            while let Some(message) = rx.recv().await {
                match message {
                    AdminMessage::Update(update) => registry.apply(update),
                    AdminMessage::Sweep => {
                        registry.sweep(Utc::now(), stale_after, config.max_tolerations);
                    }
                    AdminMessage::Describe(reply) => {
                        let _ = reply.send(registry.clone());
                    }
                    AdminMessage::Stop(reply) => {
                        let _ = reply.send(registry.clone());
                        break;
                    }
                }
            }

            for task in &tasks {
                task.abort();
            }
            info!("admin stopped");
        });

        info!(
            sweep_secs = config.sweep_interval_secs,
            stale_after_secs = config.stale_after_secs,
            "admin started"
        );
        Ok(Self { tx })
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<LivenessRegistry>) -> AdminMessage,
    ) -> Result<LivenessRegistry, AdminError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_closed| AdminError::Unavailable)?;
        rx.await.map_err(|_closed| AdminError::Unavailable)
    }

    /// Copy of the liveness table.
    pub async fn describe(&self) -> Result<LivenessRegistry, AdminError> {
        self.request(AdminMessage::Describe).await
    }

    /// Run one sweep now instead of waiting for the ticker.
    pub async fn sweep(&self) -> Result<(), AdminError> {
        self.tx
            .send(AdminMessage::Sweep)
            .await
            .map_err(|_closed| AdminError::Unavailable)
    }

    /// Persist every tracked inventory through `directory`, then stop.
    pub async fn shutdown(&self, directory: &Arc<Directory>) -> Result<ShutdownReport, AdminError> {
        let registry = self.request(AdminMessage::Stop).await?;
        let mut report = ShutdownReport::default();

        for identity in registry.records(GrainKind::Inventory).keys() {
            let id = InventoryId::from(*identity);
            let Some(handle) = directory.active_inventory(id) else {
                warn!(inventory_id = %id, "tracked inventory not hosted here");
                report.missing.push(id);
                continue;
            };
            match handle.persist().await {
                Ok(_) => report.persisted.push(id),
                Err(e) => {
                    error!(inventory_id = %id, error = %e, "persist on shutdown failed");
                    report.failed.push(id);
                }
            }
        }

        info!(
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            missing = report.missing.len(),
            "admin shutdown complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, publish_event};

    fn update(kind: UpdateKind, identity: Uuid, timestamp: DateTime<Utc>) -> GrainUpdate {
        GrainUpdate {
            update_kind: kind,
            grain_kind: GrainKind::Timer,
            identity,
            address: "node-a".to_owned(),
            timestamp,
            context: BTreeMap::new(),
        }
    }

    #[test]
    fn register_and_deregister_move_the_gauge() {
        let mut registry = LivenessRegistry::new();
        let id = Uuid::new_v4();

        registry.apply(update(UpdateKind::Register, id, Utc::now()));
        assert_eq!(registry.active(GrainKind::Timer), 1);
        assert_eq!(registry.active(GrainKind::Inventory), 0);

        registry.apply(update(UpdateKind::Deregister, id, Utc::now()));
        assert_eq!(registry.active(GrainKind::Timer), 0);

        // Unknown deregister is logged, not fatal.
        registry.apply(update(UpdateKind::Deregister, id, Utc::now()));
        assert_eq!(registry.active(GrainKind::Timer), 0);
    }

    #[test]
    fn heartbeat_refreshes_and_resets_tolerations() {
        let mut registry = LivenessRegistry::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let window = chrono::Duration::seconds(60);

        registry.apply(update(UpdateKind::Register, id, now - chrono::Duration::seconds(65)));
        let report = registry.sweep(now, window, 3);
        assert_eq!(report.stale, vec![id]);
        assert_eq!(registry.records(GrainKind::Timer)[&id].tolerations, 1);

        registry.apply(update(UpdateKind::Heartbeat, id, now));
        let record = &registry.records(GrainKind::Timer)[&id];
        assert_eq!(record.tolerations, 0);
        assert_eq!(record.last_seen, now);
        assert!(registry.sweep(now, window, 3).stale.is_empty());
    }

    #[test]
    fn heartbeat_without_register_is_tracked() {
        let mut registry = LivenessRegistry::new();
        let id = Uuid::new_v4();

        registry.apply(update(UpdateKind::Heartbeat, id, Utc::now()));
        assert_eq!(registry.active(GrainKind::Timer), 1);
        assert_eq!(registry.records(GrainKind::Timer)[&id].tolerations, 0);

        registry.apply(update(UpdateKind::Heartbeat, id, Utc::now()));
        assert_eq!(registry.active(GrainKind::Timer), 1);
    }

    #[test]
    fn repeated_staleness_escalates() {
        let mut registry = LivenessRegistry::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let window = chrono::Duration::seconds(60);
        registry.apply(update(UpdateKind::Register, id, now - chrono::Duration::seconds(65)));

        assert!(registry.sweep(now, window, 3).escalated.is_empty());
        assert!(registry.sweep(now, window, 3).escalated.is_empty());
        // The escalated sweep still counts the record as stale.
        let report = registry.sweep(now, window, 3);
        assert_eq!(report.stale, vec![id]);
        assert_eq!(report.escalated, vec![id]);
        // Flagged, never evicted.
        assert_eq!(registry.active(GrainKind::Timer), 1);
    }

    #[tokio::test]
    async fn admin_tracks_updates_from_the_bus() {
        let bus = InMemoryBus::new();
        let config = LivenessConfig {
            stale_after_secs: 60,
            ..LivenessConfig::default()
        };
        let admin = AdminHandle::start(&bus, config).await.unwrap();

        let fresh = Uuid::new_v4();
        let old = Uuid::new_v4();
        publish_event(&bus, topics::GRAIN_LIVENESS, &update(UpdateKind::Register, fresh, Utc::now()))
            .await
            .unwrap();
        publish_event(
            &bus,
            topics::GRAIN_LIVENESS,
            &update(UpdateKind::Register, old, Utc::now() - chrono::Duration::seconds(120)),
        )
        .await
        .unwrap();

        // Let the forwarder drain the subscription.
        let mut registry = admin.describe().await.unwrap();
        for _ in 0..50 {
            if registry.active(GrainKind::Timer) == 2 {
                break;
            }
            tokio::task::yield_now().await;
            registry = admin.describe().await.unwrap();
        }
        assert_eq!(registry.active(GrainKind::Timer), 2);

        admin.sweep().await.unwrap();
        let registry = admin.describe().await.unwrap();
        let records = registry.records(GrainKind::Timer);
        assert_eq!(records[&old].tolerations, 1);
        assert_eq!(records[&fresh].tolerations, 0);
    }
}
