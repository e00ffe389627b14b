//! Append-only grain snapshots in the `snapshots` table.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use avalon_core::store::{SnapshotStore, StoreError};
use avalon_types::GrainKind;

use crate::error::DbError;
use crate::postgres::PostgresPool;

/// [`SnapshotStore`] backed by `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PostgresPool,
}

impl PgSnapshotStore {
    /// Bind the store to a connected pool.
    pub const fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    async fn insert_row(&self, kind: GrainKind, identity: Uuid, data: &[u8]) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO snapshots (kind, identity, created_at, data)
              VALUES ($1, $2, now(), $3)",
        )
        .bind(kind.as_str())
        .bind(identity)
        .bind(data)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn latest_row(&self, kind: GrainKind, identity: Uuid) -> Result<Option<Vec<u8>>, DbError> {
        let row = sqlx::query(
            r"SELECT data FROM snapshots
              WHERE kind = $1 AND identity = $2
              ORDER BY created_at DESC, id DESC
              LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(identity)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(|r| r.try_get::<Vec<u8>, _>("data"))
            .transpose()
            .map_err(DbError::from)
    }

    async fn identity_rows(&self, kind: GrainKind) -> Result<Vec<Uuid>, DbError> {
        let rows = sqlx::query(r"SELECT DISTINCT identity FROM snapshots WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_all(self.pool.pool())
            .await?;
        let mut identities = Vec::with_capacity(rows.len());
        for row in &rows {
            identities.push(row.try_get::<Uuid, _>("identity")?);
        }
        Ok(identities)
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn insert(&self, kind: GrainKind, identity: Uuid, data: Vec<u8>) -> Result<(), StoreError> {
        self.insert_row(kind, identity, &data).await?;
        tracing::debug!(%kind, %identity, bytes = data.len(), "snapshot stored");
        Ok(())
    }

    async fn latest(&self, kind: GrainKind, identity: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.latest_row(kind, identity).await?)
    }

    async fn identities(&self, kind: GrainKind) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.identity_rows(kind).await?)
    }
}
