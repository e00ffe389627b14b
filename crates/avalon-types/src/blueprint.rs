//! Immutable blueprint definitions loaded into the shared catalog.
//!
//! Blueprints are authored as YAML lists (`buildings.yaml`,
//! `resources.yaml`). Durations are expressed in milliseconds so that the
//! files stay plain integers.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::BlueprintId;

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// Name of a resource, e.g. `Wood`. Resource names are case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(pub String);

impl ResourceName {
    /// Wrap a resource name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Name of a building blueprint, e.g. `woodcutter`.
///
/// Building names compare exactly, but every lookup by name goes through
/// [`BuildingName::key`], which lower-cases.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildingName(pub String);

impl BuildingName {
    /// Wrap a building name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive lookup key.
    pub fn key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl core::fmt::Display for BuildingName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BuildingName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Buildings
// ---------------------------------------------------------------------------

/// One line of a building's construction cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCost {
    /// Resource consumed.
    pub resource: ResourceName,
    /// Quantity reserved when construction starts.
    pub amount: u64,
    /// When `true` the cost is consumed on completion; otherwise it is
    /// returned to the ledger.
    #[serde(default)]
    pub permanent: bool,
}

/// A recurring, unconditional resource source unlocked by a building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    /// Resource produced.
    pub resource: ResourceName,
    /// Quantity added per tick.
    pub amount: u64,
    /// Tick length in milliseconds.
    pub tick_length_ms: u64,
}

impl Generator {
    /// Tick length as a [`Duration`].
    pub const fn tick_length(&self) -> Duration {
        Duration::from_millis(self.tick_length_ms)
    }
}

/// Input line of a transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerCost {
    /// Resource consumed.
    pub resource: ResourceName,
    /// Quantity reserved before each tick.
    pub amount: u64,
    /// Temporary inputs return to the ledger once the tick settles.
    #[serde(default, alias = "is_temporary")]
    pub temporary: bool,
}

/// Output line of a transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerResult {
    /// Resource produced.
    pub resource: ResourceName,
    /// Quantity added per settled tick.
    pub amount: u64,
}

/// A recurring process that turns reserved inputs into outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformer {
    /// Display name, unique within its building.
    pub name: String,
    /// Inputs reserved at the start of every tick.
    #[serde(default)]
    pub cost: Vec<TransformerCost>,
    /// Outputs added when the tick fires.
    #[serde(default)]
    pub result: Vec<TransformerResult>,
    /// Tick length in milliseconds.
    pub tick_length_ms: u64,
}

impl Transformer {
    /// Tick length as a [`Duration`].
    pub const fn tick_length(&self) -> Duration {
        Duration::from_millis(self.tick_length_ms)
    }
}

/// Template for a building type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingBlueprint {
    /// Identifier; derived from the name when omitted.
    #[serde(default)]
    pub id: Option<BlueprintId>,
    /// Display name, unique case-insensitively.
    pub name: BuildingName,
    /// Number of instances every new inventory starts with.
    #[serde(default, alias = "initial_amount")]
    pub initial_instances: u32,
    /// Worker capacity of a single instance.
    #[serde(default)]
    pub workers_maximum: u32,
    /// Construction cost.
    #[serde(default)]
    pub cost: Vec<ResourceCost>,
    /// Generators unlocked per completed instance.
    #[serde(default)]
    pub generates: Vec<Generator>,
    /// Transformers unlocked per completed instance.
    #[serde(default)]
    pub transforms: Vec<Transformer>,
    /// Construction time in milliseconds.
    #[serde(default)]
    pub build_time_ms: u64,
}

impl BuildingBlueprint {
    /// Effective identifier: explicit id or the name-derived one.
    pub fn blueprint_id(&self) -> BlueprintId {
        self.id
            .unwrap_or_else(|| BlueprintId::from_name(self.name.as_str()))
    }

    /// Construction time as a [`Duration`].
    pub const fn build_time(&self) -> Duration {
        Duration::from_millis(self.build_time_ms)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Template for a resource ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBlueprint {
    /// Resource name.
    pub name: ResourceName,
    /// Amount every new inventory starts with.
    #[serde(default)]
    pub starting_amount: u64,
    /// Cap before the first formula evaluation. Zero means uncapped.
    #[serde(default)]
    pub starting_cap: u64,
    /// Cap expression; empty keeps the static cap.
    #[serde(default)]
    pub cap_formula: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn building_parses_with_defaults() {
        let json = r#"{
            "name": "woodcutter",
            "initial_amount": 2,
            "cost": [{"resource": "Wood", "amount": 10}],
            "generates": [{"resource": "Wood", "amount": 1, "tick_length_ms": 5000}],
            "build_time_ms": 10000
        }"#;
        let building: BuildingBlueprint = serde_json::from_str(json).unwrap();

        assert_eq!(building.initial_instances, 2);
        assert!(!building.cost[0].permanent);
        assert!(building.transforms.is_empty());
        assert_eq!(building.build_time(), Duration::from_secs(10));
        assert_eq!(building.blueprint_id(), BlueprintId::from_name("Woodcutter"));
    }

    #[test]
    fn transformer_accepts_is_temporary_alias() {
        let json = r#"{"resource": "Wood", "amount": 2, "is_temporary": true}"#;
        let cost: TransformerCost = serde_json::from_str(json).unwrap();
        assert!(cost.temporary);
    }

    #[test]
    fn building_key_is_lowercase() {
        assert_eq!(BuildingName::from("Lumberyard").key(), "lumberyard");
    }
}
