//! Shared type definitions for the Avalon economy engine.
//!
//! This crate is the single source of truth for identifiers, enums,
//! blueprint templates and bus event envelopes used across the workspace.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for grains and building instances
//! - [`enums`] -- Timer kinds, building states, liveness kinds
//! - [`blueprint`] -- Immutable building and resource templates
//! - [`events`] -- Bus envelopes, payload keys and topic names

pub mod blueprint;
pub mod enums;
pub mod events;
pub mod ids;

// Re-export all public types at crate root for convenience.
pub use blueprint::{
    BuildingBlueprint, BuildingName, Generator, ResourceBlueprint, ResourceCost, ResourceName,
    Transformer, TransformerCost, TransformerResult,
};
pub use enums::{BuildingState, GrainKind, TimerKind, UpdateKind};
pub use events::{GrainUpdate, Payload, TimerFired, TimerStopped, keys, topics};
pub use ids::{BlueprintId, BuildingId, InventoryId, TimerId};
