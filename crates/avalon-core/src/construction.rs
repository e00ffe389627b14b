//! Construction registry: per-blueprint queue and completed sets.
//!
//! A [`BuildingInstance`] is created `Queued` when construction starts and
//! moves to `Active` exactly once, when its building timer fires. It never
//! moves back. The registry enforces a single build slot per inventory: at
//! most one instance may be queued across all blueprints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use avalon_types::{
    BlueprintId, BuildingBlueprint, BuildingId, BuildingName, BuildingState, ResourceCost,
    TimerId,
};

use crate::catalog::BlueprintCatalog;

/// Errors raised by registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstructionError {
    /// Another instance is already queued.
    #[error("build slot occupied")]
    SlotOccupied,

    /// No register exists for the blueprint.
    #[error("unknown blueprint {0}")]
    UnknownBlueprint(BlueprintId),
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One building owned by an inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingInstance {
    /// Instance id.
    pub id: BuildingId,
    /// Blueprint this instance was built from.
    pub blueprint_id: BlueprintId,
    /// Blueprint name at construction time.
    pub name: BuildingName,
    /// Lifecycle state.
    pub state: BuildingState,
    /// Worker capacity.
    pub workers_max: u32,
    /// Workers currently assigned.
    pub workers_current: u32,
    /// Scheduled completion while queued; actual completion once active.
    pub completion_time: DateTime<Utc>,
    /// Costs reserved for this construction, settled on completion.
    pub reserved_costs: Vec<ResourceCost>,
    /// Timer driving construction, while queued.
    pub building_timer_id: Option<TimerId>,
    /// Generator timers started for this instance.
    pub generator_timer_ids: Vec<TimerId>,
    /// Transformer timers started for this instance.
    pub transformer_timer_ids: Vec<TimerId>,
}

impl BuildingInstance {
    /// A freshly queued instance of `blueprint`.
    pub fn queued(blueprint: &BuildingBlueprint, completion_time: DateTime<Utc>) -> Self {
        Self {
            id: BuildingId::new(),
            blueprint_id: blueprint.blueprint_id(),
            name: blueprint.name.clone(),
            state: BuildingState::Queued,
            workers_max: blueprint.workers_maximum,
            workers_current: 0,
            completion_time,
            reserved_costs: blueprint.cost.clone(),
            building_timer_id: None,
            generator_timer_ids: Vec::new(),
            transformer_timer_ids: Vec::new(),
        }
    }

    /// An instance that starts out active, without reserved costs.
    pub fn active(blueprint: &BuildingBlueprint, completion_time: DateTime<Utc>) -> Self {
        Self {
            state: BuildingState::Active,
            reserved_costs: Vec::new(),
            ..Self::queued(blueprint, completion_time)
        }
    }
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

/// Instances of a single blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingRegister {
    /// Blueprint id.
    pub blueprint_id: BlueprintId,
    /// Blueprint name.
    pub name: BuildingName,
    /// Active instances.
    pub completed: BTreeMap<BuildingId, BuildingInstance>,
    /// Queued instances.
    pub queue: BTreeMap<BuildingId, BuildingInstance>,
}

impl BuildingRegister {
    /// An empty register for `blueprint`.
    pub fn new(blueprint: &BuildingBlueprint) -> Self {
        Self {
            blueprint_id: blueprint.blueprint_id(),
            name: blueprint.name.clone(),
            completed: BTreeMap::new(),
            queue: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every building register of one inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructionRegistry {
    registers: BTreeMap<BlueprintId, BuildingRegister>,
}

impl ConstructionRegistry {
    /// Cold-start state: one register per blueprint, seeded with its
    /// initial active instances.
    pub fn starting(catalog: &BlueprintCatalog, at: DateTime<Utc>) -> Self {
        let mut registry = Self::default();
        for blueprint in catalog.buildings() {
            let mut register = BuildingRegister::new(blueprint);
            for _ in 0..blueprint.initial_instances {
                let instance = BuildingInstance::active(blueprint, at);
                register.completed.insert(instance.id, instance);
            }
            registry.registers.insert(register.blueprint_id, register);
        }
        registry
    }

    /// Rebuild a registry from stored registers.
    pub fn from_registers(registers: impl IntoIterator<Item = BuildingRegister>) -> Self {
        Self {
            registers: registers
                .into_iter()
                .map(|r| (r.blueprint_id, r))
                .collect(),
        }
    }

    /// Ensure a register exists for `blueprint`.
    pub fn ensure_register(&mut self, blueprint: &BuildingBlueprint) {
        self.registers
            .entry(blueprint.blueprint_id())
            .or_insert_with(|| BuildingRegister::new(blueprint));
    }

    /// Registers in blueprint-id order.
    pub fn registers(&self) -> impl Iterator<Item = &BuildingRegister> {
        self.registers.values()
    }

    /// Number of queued instances across all registers.
    pub fn queued_count(&self) -> usize {
        self.registers.values().map(|r| r.queue.len()).sum()
    }

    /// Every queued instance.
    pub fn queued(&self) -> impl Iterator<Item = &BuildingInstance> {
        self.registers.values().flat_map(|r| r.queue.values())
    }

    /// Every active instance.
    pub fn active(&self) -> impl Iterator<Item = &BuildingInstance> {
        self.registers.values().flat_map(|r| r.completed.values())
    }

    /// Queue a new instance, enforcing the single build slot.
    pub fn enqueue(&mut self, instance: BuildingInstance) -> Result<(), ConstructionError> {
        if self.queued_count() > 0 {
            return Err(ConstructionError::SlotOccupied);
        }
        let register = self
            .registers
            .get_mut(&instance.blueprint_id)
            .ok_or(ConstructionError::UnknownBlueprint(instance.blueprint_id))?;
        register.queue.insert(instance.id, instance);
        Ok(())
    }

    /// Move a queued instance to completed and mark it active.
    ///
    /// Returns `None` when the instance is not queued, which makes repeated
    /// completion attempts no-ops.
    pub fn complete(
        &mut self,
        blueprint_id: BlueprintId,
        building_id: BuildingId,
        at: DateTime<Utc>,
    ) -> Option<&mut BuildingInstance> {
        let register = self.registers.get_mut(&blueprint_id)?;
        let mut instance = register.queue.remove(&building_id)?;
        instance.state = BuildingState::Active;
        instance.completion_time = at;
        instance.building_timer_id = None;
        Some(register.completed.entry(building_id).or_insert(instance))
    }

    /// Mutable access to an instance in either set.
    pub fn instance_mut(&mut self, building_id: BuildingId) -> Option<&mut BuildingInstance> {
        self.registers.values_mut().find_map(|r| {
            if r.queue.contains_key(&building_id) {
                r.queue.get_mut(&building_id)
            } else {
                r.completed.get_mut(&building_id)
            }
        })
    }

    /// Look up an instance in either set.
    pub fn instance(&self, building_id: BuildingId) -> Option<&BuildingInstance> {
        self.registers
            .values()
            .find_map(|r| r.queue.get(&building_id).or_else(|| r.completed.get(&building_id)))
    }

    /// Completed instance count per lower-cased building name.
    pub fn completed_counts(&self) -> BTreeMap<String, u64> {
        self.registers
            .values()
            .map(|r| (r.name.key(), u64::try_from(r.completed.len()).unwrap_or(u64::MAX)))
            .collect()
    }
}
