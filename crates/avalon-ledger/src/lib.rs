//! Resource ledger for the Avalon economy engine.
//!
//! Each Inventory grain owns one [`ResourceLedger`]. The ledger tracks, per
//! resource, the spendable `amount`, the `reserved` quantity held by
//! in-flight constructions and transformer ticks, and the `cap` computed
//! from a per-resource formula.
//!
//! # Modules
//!
//! - [`ledger`] -- The [`ResourceLedger`]: reserve, release, generate, caps.
//! - [`formula`] -- The sandboxed [`CapFormula`] evaluator.
//!
//! # Reservation protocol
//!
//! ```
//! use std::collections::BTreeMap;
//! use avalon_ledger::{LedgerEntry, ResourceLedger};
//! use avalon_types::ResourceName;
//!
//! let wood = ResourceName::from("Wood");
//! let mut ledger = ResourceLedger::new();
//! ledger.insert(LedgerEntry::new(wood.clone(), 100, 0));
//!
//! let request = BTreeMap::from([(wood.clone(), 40)]);
//! assert!(ledger.reserve(&request).is_ok());
//!
//! // On completion a non-permanent cost returns to the spendable amount.
//! assert!(ledger.release(&wood, 40, false).is_ok());
//! assert_eq!(ledger.get(&wood).map(|e| e.amount), Some(100));
//! ```

pub mod formula;
pub mod ledger;

// Re-export primary types at crate root.
pub use formula::{CapFormula, FormulaError, FormulaInputs};
pub use ledger::{LedgerEntry, ResourceLedger};

use avalon_types::ResourceName;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when mutating a resource ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The resource has no entry in this ledger.
    #[error("unknown resource: {resource}")]
    UnknownResource {
        /// The missing resource.
        resource: ResourceName,
    },

    /// One or more resources in a batch could not be covered.
    #[error("insufficient resources: {}", format_names(.resources))]
    InsufficientResources {
        /// Every resource in the batch whose amount was too low.
        resources: Vec<ResourceName>,
    },

    /// A cap formula failed to evaluate.
    #[error("cap formula for {resource} failed: {source}")]
    Formula {
        /// The resource whose cap could not be computed.
        resource: ResourceName,
        /// The evaluation error.
        source: FormulaError,
    },
}

fn format_names(names: &[ResourceName]) -> String {
    names
        .iter()
        .map(ResourceName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
