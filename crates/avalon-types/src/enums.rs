//! Enumeration types shared by the economy grains.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Behavioral mode of a Timer grain, chosen once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// One-shot deadline driving a building's construction.
    Building,
    /// Infinite periodic emitter adding resources each tick.
    Generator,
    /// Infinite periodic emitter gated by a reservation of input costs.
    Transformer,
}

impl TimerKind {
    /// Short lowercase label used in logs and liveness context.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Generator => "generator",
            Self::Transformer => "transformer",
        }
    }
}

impl core::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Buildings
// ---------------------------------------------------------------------------

/// Lifecycle state of a building instance.
///
/// `Queued` moves to `Active` exactly once; `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingState {
    /// Under construction, waiting for its building timer.
    Queued,
    /// Construction finished.
    Active,
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Kind of grain tracked by the admin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrainKind {
    /// A per-player Inventory grain.
    Inventory,
    /// A Timer grain.
    Timer,
}

impl GrainKind {
    /// Label used as the `kind` column of the snapshot store.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Timer => "timer",
        }
    }
}

impl core::fmt::Display for GrainKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of liveness update a grain sends to the admin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// The grain became active.
    Register,
    /// The grain terminated.
    Deregister,
    /// The grain is still alive.
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TimerKind::Transformer).unwrap();
        assert_eq!(json, "\"transformer\"");
        assert_eq!(TimerKind::Generator.to_string(), "generator");
    }

    #[test]
    fn grain_kind_labels() {
        assert_eq!(GrainKind::Inventory.as_str(), "inventory");
        assert_eq!(GrainKind::Timer.to_string(), "timer");
    }
}
