//! Per-player resource bookkeeping: amount, reserved and cap per resource.
//!
//! The [`ResourceLedger`] is owned by exactly one Inventory grain and is
//! only ever touched from that grain's message loop, so it needs no
//! internal locking. Every mutating operation either fully succeeds or
//! leaves the ledger exactly as it found it.
//!
//! # Invariants
//!
//! For every entry:
//! - `amount` and `reserved` are non-negative (`u64`).
//! - If `cap > 0` then `amount + reserved <= cap` after every [`generate`]
//!   and [`recompute_caps`]. A cap of zero means "uncapped".
//!
//! [`generate`]: ResourceLedger::generate
//! [`recompute_caps`]: ResourceLedger::recompute_caps

use std::collections::BTreeMap;

use tracing::{debug, warn};

use avalon_types::{ResourceName, TransformerCost, TransformerResult};

use crate::LedgerError;
use crate::formula::{CapFormula, FormulaInputs};

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// Bookkeeping for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Resource name.
    pub name: ResourceName,
    /// Freely spendable quantity.
    pub amount: u64,
    /// Quantity held by outstanding reservations.
    pub reserved: u64,
    /// Upper bound on `amount + reserved`; zero means uncapped.
    pub cap: u64,
    formula: Option<CapFormula>,
}

impl LedgerEntry {
    /// Create an entry with no cap formula.
    pub const fn new(name: ResourceName, amount: u64, cap: u64) -> Self {
        Self {
            name,
            amount,
            reserved: 0,
            cap,
            formula: None,
        }
    }

    /// Attach a compiled cap formula.
    #[must_use]
    pub fn with_formula(mut self, formula: Option<CapFormula>) -> Self {
        self.formula = formula;
        self
    }

    /// Set the reserved quantity (used when restoring a snapshot).
    #[must_use]
    pub const fn with_reserved(mut self, reserved: u64) -> Self {
        self.reserved = reserved;
        self
    }

    /// Source text of the cap formula, empty when there is none.
    pub fn cap_expression(&self) -> &str {
        self.formula.as_ref().map_or("", CapFormula::source)
    }

    /// `amount + reserved`, saturating.
    pub const fn total(&self) -> u64 {
        self.amount.saturating_add(self.reserved)
    }

    /// Clamp `amount` so that `amount + reserved <= cap` when capped.
    fn clamp_to_cap(&mut self) {
        if self.cap > 0 && self.total() > self.cap {
            self.amount = self.cap.saturating_sub(self.reserved);
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// All resource entries of one inventory, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLedger {
    entries: BTreeMap<ResourceName, LedgerEntry>,
}

impl ResourceLedger {
    /// Create an empty ledger.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, entry: LedgerEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Look up an entry.
    pub fn get(&self, resource: &ResourceName) -> Option<&LedgerEntry> {
        self.entries.get(resource)
    }

    /// Iterate entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current spendable amount per resource, as read by cap formulas.
    pub fn amounts(&self) -> BTreeMap<String, u64> {
        self.entries
            .values()
            .map(|e| (e.name.as_str().to_owned(), e.amount))
            .collect()
    }

    /// Move the requested quantities from `amount` to `reserved`.
    ///
    /// All-or-nothing across the batch: if any resource is unknown or
    /// short, every line already applied in this call is rolled back and
    /// the ledger is unchanged. Unknown resources are reported before
    /// shortages.
    pub fn reserve(
        &mut self,
        request: &BTreeMap<ResourceName, u64>,
    ) -> Result<(), LedgerError> {
        if let Some(unknown) = request.keys().find(|r| !self.entries.contains_key(*r)) {
            return Err(LedgerError::UnknownResource {
                resource: unknown.clone(),
            });
        }

        let mut journal: Vec<(&ResourceName, u64)> = Vec::with_capacity(request.len());
        let mut short = Vec::new();

        for (resource, &quantity) in request {
            let Some(entry) = self.entries.get_mut(resource) else {
                continue;
            };
            if entry.amount >= quantity {
                entry.amount = entry.amount.saturating_sub(quantity);
                entry.reserved = entry.reserved.saturating_add(quantity);
                journal.push((resource, quantity));
            } else {
                short.push(resource.clone());
            }
        }

        if short.is_empty() {
            debug!(resources = ?request, "reserved resources");
            return Ok(());
        }

        for (resource, quantity) in journal {
            if let Some(entry) = self.entries.get_mut(resource) {
                entry.reserved = entry.reserved.saturating_sub(quantity);
                entry.amount = entry.amount.saturating_add(quantity);
                debug!(%resource, quantity, "rolled back reservation");
            }
        }

        Err(LedgerError::InsufficientResources { resources: short })
    }

    /// Settle one reserved cost line.
    ///
    /// The line leaves `reserved`; non-permanent lines go back to `amount`,
    /// permanent lines are consumed.
    pub fn release(
        &mut self,
        resource: &ResourceName,
        quantity: u64,
        permanent: bool,
    ) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get_mut(resource)
            .ok_or_else(|| LedgerError::UnknownResource {
                resource: resource.clone(),
            })?;

        if entry.reserved < quantity {
            warn!(
                %resource,
                quantity,
                reserved = entry.reserved,
                "release exceeds reserved amount"
            );
        }
        let released = quantity.min(entry.reserved);
        entry.reserved = entry.reserved.saturating_sub(released);
        if !permanent {
            entry.amount = entry.amount.saturating_add(released);
        }
        debug!(%resource, released, permanent, "released reservation");
        Ok(())
    }

    /// Add `delta` to `amount`, clamped to the cap.
    ///
    /// Returns the quantity actually added. Already at cap is a no-op.
    pub fn generate(&mut self, resource: &ResourceName, delta: u64) -> Result<u64, LedgerError> {
        let entry = self
            .entries
            .get_mut(resource)
            .ok_or_else(|| LedgerError::UnknownResource {
                resource: resource.clone(),
            })?;

        let added = if entry.cap > 0 {
            let room = entry.cap.saturating_sub(entry.total());
            if room == 0 {
                debug!(
                    %resource,
                    generated = delta,
                    amount = entry.amount,
                    reserved = entry.reserved,
                    cap = entry.cap,
                    "resource already at cap"
                );
                return Ok(0);
            }
            delta.min(room)
        } else {
            delta
        };

        entry.amount = entry.amount.saturating_add(added);
        debug!(
            %resource,
            generated = delta,
            added,
            amount = entry.amount,
            cap = entry.cap,
            "resource updated"
        );
        Ok(added)
    }

    /// Re-evaluate every cap formula and re-clamp amounts.
    ///
    /// `building_counts` maps lower-cased building names to completed
    /// instance counts. A formula that fails to evaluate keeps the previous
    /// cap; the first such failure is returned after all entries have been
    /// processed.
    pub fn recompute_caps(
        &mut self,
        building_counts: &BTreeMap<String, u64>,
    ) -> Result<(), LedgerError> {
        let amounts = self.amounts();
        let inputs = FormulaInputs {
            buildings: building_counts,
            resources: &amounts,
        };

        let mut first_failure = None;
        for entry in self.entries.values_mut() {
            let Some(formula) = entry.formula.as_ref() else {
                continue;
            };
            match formula.evaluate(inputs) {
                Ok(value) => {
                    let cap = u64::try_from(value).unwrap_or(0);
                    if cap != entry.cap {
                        debug!(resource = %entry.name, old = entry.cap, new = cap, "cap updated");
                    }
                    entry.cap = cap;
                    entry.clamp_to_cap();
                }
                Err(source) => {
                    warn!(resource = %entry.name, error = %source, "cap formula failed");
                    if first_failure.is_none() {
                        first_failure = Some(LedgerError::Formula {
                            resource: entry.name.clone(),
                            source,
                        });
                    }
                }
            }
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// Settle one transformer tick: add results, then release inputs.
    ///
    /// Results are capped like [`generate`](Self::generate). Temporary
    /// inputs return to `amount`; the rest are consumed.
    pub fn settle_transform(
        &mut self,
        results: &[TransformerResult],
        costs: &[TransformerCost],
    ) -> Result<(), LedgerError> {
        for result in results {
            self.generate(&result.resource, result.amount)?;
        }
        for cost in costs {
            self.release(&cost.resource, cost.amount, !cost.temporary)?;
        }
        Ok(())
    }
}
