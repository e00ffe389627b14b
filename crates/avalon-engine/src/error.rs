//! Error types for the engine binary.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error so `main` can propagate
/// with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: avalon_core::ConfigError,
    },

    /// The blueprint catalog is missing or invalid.
    #[error("catalog error: {source}")]
    Catalog {
        /// The underlying catalog error.
        #[from]
        source: avalon_core::CatalogError,
    },

    /// Database connection or migration failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: avalon_db::DbError,
    },

    /// The snapshot store failed while restoring grains.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: avalon_core::StoreError,
    },

    /// The admin grain failed to start or stop.
    #[error("admin error: {source}")]
    Admin {
        /// The underlying admin error.
        #[from]
        source: avalon_core::AdminError,
    },

    /// NATS connection failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// Waiting for the shutdown signal failed.
    #[error("signal error: {0}")]
    Signal(#[from] std::io::Error),
}
