//! Read-only blueprint catalog shared by every grain on a node.
//!
//! The catalog is loaded once at startup from two YAML lists,
//! `buildings.yaml` and `resources.yaml`, validated, and then shared behind
//! an [`Arc`](std::sync::Arc). Cap formulas are compiled here so that a
//! malformed formula stops the node at boot instead of failing later inside
//! a grain.

use std::collections::BTreeMap;
use std::path::Path;

use avalon_ledger::{CapFormula, FormulaError};
use avalon_types::{BlueprintId, BuildingBlueprint, ResourceBlueprint, ResourceName};

/// File name of the building list inside the blueprint directory.
pub const BUILDINGS_FILE: &str = "buildings.yaml";

/// File name of the resource list inside the blueprint directory.
pub const RESOURCES_FILE: &str = "resources.yaml";

/// Errors raised while loading or validating blueprints.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A blueprint file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A blueprint file is not valid YAML for its schema.
    #[error("failed to parse blueprint YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        #[from]
        source: serde_yml::Error,
    },

    /// Two buildings share a name (case-insensitive) or id.
    #[error("duplicate building blueprint: {name}")]
    DuplicateBuilding {
        /// The duplicated name.
        name: String,
    },

    /// Two resources share a name.
    #[error("duplicate resource blueprint: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },

    /// A building references a resource that is not defined.
    #[error("building {building} references unknown resource {resource}")]
    UnknownResource {
        /// The referencing building.
        building: String,
        /// The missing resource.
        resource: String,
    },

    /// A generator or transformer has a zero tick length.
    #[error("building {building} declares a zero tick length")]
    ZeroTickLength {
        /// The offending building.
        building: String,
    },

    /// A cap formula does not compile.
    #[error("invalid cap formula for {resource}: {source}")]
    Formula {
        /// The resource owning the formula.
        resource: String,
        /// The compile error.
        source: FormulaError,
    },
}

/// A resource blueprint together with its compiled cap formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogResource {
    /// The blueprint as authored.
    pub blueprint: ResourceBlueprint,
    /// Compiled formula, `None` when `cap_formula` is empty.
    pub formula: Option<CapFormula>,
}

/// Immutable index of every building and resource blueprint.
#[derive(Debug, Clone, Default)]
pub struct BlueprintCatalog {
    buildings: BTreeMap<String, BuildingBlueprint>,
    ids: BTreeMap<BlueprintId, String>,
    resources: BTreeMap<ResourceName, CatalogResource>,
}

impl BlueprintCatalog {
    /// Load `buildings.yaml` and `resources.yaml` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, CatalogError> {
        let buildings = read(&dir.join(BUILDINGS_FILE))?;
        let resources = read(&dir.join(RESOURCES_FILE))?;
        Self::from_yaml(&buildings, &resources)
    }

    /// Parse both lists from YAML strings.
    pub fn from_yaml(buildings: &str, resources: &str) -> Result<Self, CatalogError> {
        let buildings: Vec<BuildingBlueprint> = serde_yml::from_str(buildings)?;
        let resources: Vec<ResourceBlueprint> = serde_yml::from_str(resources)?;
        Self::from_parts(buildings, resources)
    }

    /// Build and validate a catalog from already-parsed blueprints.
    pub fn from_parts(
        buildings: Vec<BuildingBlueprint>,
        resources: Vec<ResourceBlueprint>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();

        for resource in resources {
            let formula = if resource.cap_formula.trim().is_empty() {
                None
            } else {
                Some(CapFormula::parse(&resource.cap_formula).map_err(|source| {
                    CatalogError::Formula {
                        resource: resource.name.to_string(),
                        source,
                    }
                })?)
            };
            let name = resource.name.clone();
            if catalog.resources.contains_key(&name) {
                return Err(CatalogError::DuplicateResource {
                    name: name.to_string(),
                });
            }
            catalog.resources.insert(
                name,
                CatalogResource {
                    blueprint: resource,
                    formula,
                },
            );
        }

        for mut building in buildings {
            let key = building.name.key();
            let id = building.blueprint_id();
            building.id = Some(id);

            if catalog.buildings.contains_key(&key) || catalog.ids.contains_key(&id) {
                return Err(CatalogError::DuplicateBuilding {
                    name: building.name.to_string(),
                });
            }
            catalog.validate_building(&building)?;

            catalog.ids.insert(id, key.clone());
            catalog.buildings.insert(key, building);
        }

        Ok(catalog)
    }

    fn validate_building(&self, building: &BuildingBlueprint) -> Result<(), CatalogError> {
        let referenced = building
            .cost
            .iter()
            .map(|c| &c.resource)
            .chain(building.generates.iter().map(|g| &g.resource))
            .chain(building.transforms.iter().flat_map(|t| {
                t.cost
                    .iter()
                    .map(|c| &c.resource)
                    .chain(t.result.iter().map(|r| &r.resource))
            }));

        for resource in referenced {
            if !self.resources.contains_key(resource) {
                return Err(CatalogError::UnknownResource {
                    building: building.name.to_string(),
                    resource: resource.to_string(),
                });
            }
        }

        let zero_tick = building.generates.iter().any(|g| g.tick_length_ms == 0)
            || building.transforms.iter().any(|t| t.tick_length_ms == 0);
        if zero_tick {
            return Err(CatalogError::ZeroTickLength {
                building: building.name.to_string(),
            });
        }

        Ok(())
    }

    /// Look up a building by name, case-insensitively.
    pub fn building(&self, name: &str) -> Option<&BuildingBlueprint> {
        self.buildings.get(&name.to_lowercase())
    }

    /// Look up a building by id.
    pub fn building_by_id(&self, id: BlueprintId) -> Option<&BuildingBlueprint> {
        self.ids.get(&id).and_then(|key| self.buildings.get(key))
    }

    /// Every building, ordered by lower-cased name.
    pub fn buildings(&self) -> impl Iterator<Item = &BuildingBlueprint> {
        self.buildings.values()
    }

    /// Look up a resource by exact name.
    pub fn resource(&self, name: &ResourceName) -> Option<&CatalogResource> {
        self.resources.get(name)
    }

    /// Every resource, ordered by name.
    pub fn resources(&self) -> impl Iterator<Item = &CatalogResource> {
        self.resources.values()
    }
}

fn read(path: &Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })
}
