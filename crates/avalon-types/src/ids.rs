//! Type-safe identifier wrappers around [`Uuid`].
//!
//! Every grain and every building instance has a strongly-typed ID so that a
//! timer id can never be handed to an API expecting an inventory id. Fresh
//! ids use UUID v7 (time-ordered); blueprint and player-derived inventory
//! ids are name-based (UUID v5 in the OID namespace) so that every node in
//! the cluster derives the same value from the same name.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around [`Uuid`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new identifier using UUID v7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Return the inner [`Uuid`] value.
            pub const fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Unique identifier of an Inventory grain (one per player).
    InventoryId
}

define_id! {
    /// Unique identifier of a Timer grain.
    TimerId
}

define_id! {
    /// Unique identifier of a single building instance.
    BuildingId
}

define_id! {
    /// Identifier of a building blueprint in the catalog.
    BlueprintId
}

impl InventoryId {
    /// Derive the inventory id owned by a player.
    ///
    /// The same player id always maps to the same inventory, on every node.
    pub fn for_player(player: Uuid) -> Self {
        let label = format!("{player}-inventory");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, label.as_bytes()))
    }
}

impl BlueprintId {
    /// Derive the blueprint id from a building name (case-insensitive).
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            name.to_lowercase().as_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blueprint_id_ignores_case() {
        assert_eq!(BlueprintId::from_name("House"), BlueprintId::from_name("house"));
        assert_ne!(BlueprintId::from_name("house"), BlueprintId::from_name("warehouse"));
    }

    #[test]
    fn inventory_id_is_stable_per_player() {
        let player = Uuid::new_v4();
        assert_eq!(InventoryId::for_player(player), InventoryId::for_player(player));
        assert_ne!(
            InventoryId::for_player(player),
            InventoryId::for_player(Uuid::new_v4())
        );
    }

    #[test]
    fn ids_parse_from_display() {
        let id = TimerId::new();
        let parsed: TimerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
