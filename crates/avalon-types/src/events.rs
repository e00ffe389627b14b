//! Bus event envelopes, payload keys and topic names.
//!
//! All events travel as JSON documents. Timer payloads are open key/value
//! maps so that one Timer grain implementation can drive buildings,
//! generators and transformers alike; the well-known keys live in [`keys`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::enums::{GrainKind, UpdateKind};
use crate::ids::{InventoryId, TimerId};

/// Structured payload carried by a timer and echoed on every fire.
pub type Payload = serde_json::Map<String, Value>;

/// Well-known payload keys.
pub mod keys {
    /// Building instance id.
    pub const ID: &str = "id";
    /// Building name.
    pub const BUILDING: &str = "building";
    /// Generated amount.
    pub const AMOUNT: &str = "amount";
    /// Generated resource.
    pub const RESOURCE: &str = "resource";
    /// Skip starting generators and transformers on completion.
    pub const DISABLE_GENERATORS: &str = "disable_generators";
    /// Transformer inputs: list of `{resource, amount, temporary}`.
    pub const COST: &str = "cost";
    /// Transformer outputs: list of `{resource, amount}`.
    pub const RESULT: &str = "result";
    /// Whether a transformer input is returned after settlement.
    pub const TEMPORARY: &str = "temporary";
    /// Transformer name.
    pub const TRANSFORMER: &str = "transformer";
}

/// Topic names.
pub mod topics {
    use crate::ids::InventoryId;

    /// Global topic receiving [`super::TimerStopped`] events.
    pub const TIMER_STATUS: &str = "timer-status";

    /// Global topic receiving [`super::GrainUpdate`] events.
    pub const GRAIN_LIVENESS: &str = "grain-liveness";

    /// Building completion callbacks for one inventory.
    pub fn building_callbacks(inventory: InventoryId) -> String {
        format!("{inventory}-building-callbacks")
    }

    /// Generator callbacks for one inventory.
    pub fn resource_callbacks(inventory: InventoryId) -> String {
        format!("{inventory}-resource-callbacks")
    }

    /// Transformer callbacks for one inventory.
    pub fn transform_callbacks(inventory: InventoryId) -> String {
        format!("{inventory}-transform-callbacks")
    }
}

/// Published on the timer's reply topic every time it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerFired {
    /// The timer that fired.
    pub timer_id: TimerId,
    /// 1-based fire counter, unique per timer.
    pub sequence: u64,
    /// When the fire was emitted.
    pub timestamp: DateTime<Utc>,
    /// The payload the timer was created with.
    pub payload: Payload,
}

/// Published on [`topics::TIMER_STATUS`] when a timer self-terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStopped {
    /// The timer that stopped.
    pub timer_id: TimerId,
    /// Owning inventory, so subscribers can filter cheaply.
    pub inventory_id: InventoryId,
    /// When the timer stopped.
    pub timestamp: DateTime<Utc>,
}

/// Liveness update sent by every grain to the admin registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainUpdate {
    /// Register, heartbeat or deregister.
    pub update_kind: UpdateKind,
    /// Which collection the grain belongs to.
    pub grain_kind: GrainKind,
    /// Stable grain identity.
    pub identity: Uuid,
    /// Address of the node hosting the grain.
    pub address: String,
    /// When the update was emitted.
    pub timestamp: DateTime<Utc>,
    /// Free-form descriptive context.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Payload accessors
// ---------------------------------------------------------------------------

/// Read a string field.
pub fn payload_str<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

/// Read an unsigned integer field.
pub fn payload_u64(payload: &Payload, key: &str) -> Option<u64> {
    payload.get(key).and_then(Value::as_u64)
}

/// Read a boolean field, defaulting to `false`.
pub fn payload_flag(payload: &Payload, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}
