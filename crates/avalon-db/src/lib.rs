//! `PostgreSQL` persistence for the Avalon economy engine.
//!
//! Grain snapshots are opaque versioned byte blobs. Every persist appends a
//! row and restore reads the newest row for a grain, so history is kept and
//! a failed write never clobbers the previous snapshot.
//!
//! # Modules
//!
//! - [`postgres`] -- `PostgreSQL` connection pool
//! - [`snapshot_store`] -- [`PgSnapshotStore`], the `SnapshotStore` backend
//! - [`error`] -- Shared error types

pub mod error;
pub mod postgres;
pub mod snapshot_store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use postgres::PostgresPool;
pub use snapshot_store::PgSnapshotStore;
