//! Versioned binary snapshots of inventory state.
//!
//! The wire layout is a `u16` schema version followed by the bincode body.
//! Readers check the version before touching the body, so an old node
//! refuses a newer snapshot instead of misreading it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use avalon_ledger::{CapFormula, FormulaError, LedgerEntry, ResourceLedger};
use avalon_types::{InventoryId, ResourceName, TimerId};

use crate::construction::{BuildingRegister, ConstructionRegistry};

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Errors raised while encoding or decoding snapshots.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Serialization failed.
    #[error("failed to encode snapshot: {source}")]
    Encode {
        /// The underlying bincode error.
        source: bincode::Error,
    },

    /// The bytes are not a valid snapshot.
    #[error("failed to decode snapshot: {source}")]
    Decode {
        /// The underlying bincode error.
        source: bincode::Error,
    },

    /// The snapshot was written by an unknown schema version.
    #[error("unsupported snapshot version {found}, expected {SNAPSHOT_VERSION}")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u16,
    },

    /// A stored cap expression no longer compiles.
    #[error("stored cap formula for {resource} is invalid: {source}")]
    Formula {
        /// Resource owning the formula.
        resource: ResourceName,
        /// The compile error.
        source: FormulaError,
    },
}

/// Persisted form of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource name.
    pub name: ResourceName,
    /// Cap formula source, empty when static.
    pub cap_expression: String,
    /// Cap at persist time.
    pub cap: u64,
    /// Spendable amount.
    pub amount: u64,
    /// Reserved amount.
    pub reserved: u64,
}

/// Full persisted state of one inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    /// Owning inventory.
    pub inventory_id: InventoryId,
    /// Building registers, queued and completed instances included.
    pub registers: Vec<BuildingRegister>,
    /// Ledger entries.
    pub resources: Vec<ResourceSnapshot>,
    /// Timers outstanding at persist time.
    pub timers: BTreeSet<TimerId>,
}

impl InventorySnapshot {
    /// Capture the persistable state of an inventory.
    pub fn capture(
        inventory_id: InventoryId,
        registry: &ConstructionRegistry,
        ledger: &ResourceLedger,
        timers: &BTreeSet<TimerId>,
    ) -> Self {
        Self {
            inventory_id,
            registers: registry.registers().cloned().collect(),
            resources: ledger
                .entries()
                .map(|e| ResourceSnapshot {
                    name: e.name.clone(),
                    cap_expression: e.cap_expression().to_owned(),
                    cap: e.cap,
                    amount: e.amount,
                    reserved: e.reserved,
                })
                .collect(),
            timers: timers.clone(),
        }
    }

    /// Rebuild the construction registry.
    pub fn registry(&self) -> ConstructionRegistry {
        ConstructionRegistry::from_registers(self.registers.iter().cloned())
    }

    /// Rebuild the ledger, recompiling stored cap formulas.
    pub fn ledger(&self) -> Result<ResourceLedger, SnapshotError> {
        let mut ledger = ResourceLedger::new();
        for resource in &self.resources {
            let formula = if resource.cap_expression.is_empty() {
                None
            } else {
                Some(CapFormula::parse(&resource.cap_expression).map_err(|source| {
                    SnapshotError::Formula {
                        resource: resource.name.clone(),
                        source,
                    }
                })?)
            };
            ledger.insert(
                LedgerEntry::new(resource.name.clone(), resource.amount, resource.cap)
                    .with_reserved(resource.reserved)
                    .with_formula(formula),
            );
        }
        Ok(ledger)
    }

    /// Encode with the version header.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(&(SNAPSHOT_VERSION, self))
            .map_err(|source| SnapshotError::Encode { source })
    }

    /// Decode, rejecting unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let version: u16 =
            bincode::deserialize(bytes).map_err(|source| SnapshotError::Decode { source })?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion { found: version });
        }
        let (_, snapshot): (u16, Self) =
            bincode::deserialize(bytes).map_err(|source| SnapshotError::Decode { source })?;
        Ok(snapshot)
    }
}
