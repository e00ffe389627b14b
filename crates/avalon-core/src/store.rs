//! Durable snapshot port.
//!
//! Snapshots are append-only rows keyed by `(kind, identity, created_at)`.
//! Persisting inserts a new row; restoring reads the most recent row for a
//! `(kind, identity)` pair. The PostgreSQL implementation lives in
//! `avalon-db`; [`InMemoryStore`] serves single-node runs and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use avalon_types::GrainKind;

/// Errors raised by a snapshot store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("snapshot store error: {message}")]
    Backend {
        /// Backend error message.
        message: String,
    },
}

/// Append-only snapshot storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Append a snapshot for `(kind, identity)`.
    async fn insert(&self, kind: GrainKind, identity: Uuid, data: Vec<u8>)
    -> Result<(), StoreError>;

    /// Most recent snapshot for `(kind, identity)`, if any.
    async fn latest(&self, kind: GrainKind, identity: Uuid)
    -> Result<Option<Vec<u8>>, StoreError>;

    /// Every identity of `kind` that has at least one snapshot.
    async fn identities(&self, kind: GrainKind) -> Result<Vec<Uuid>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    created_at: DateTime<Utc>,
    data: Vec<u8>,
}

/// Process-local snapshot store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<(GrainKind, Uuid), Vec<StoredSnapshot>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows stored for `(kind, identity)`.
    pub fn row_count(&self, kind: GrainKind, identity: Uuid) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, identity))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn insert(
        &self,
        kind: GrainKind,
        identity: Uuid,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((kind, identity))
            .or_default()
            .push(StoredSnapshot {
                created_at: Utc::now(),
                data,
            });
        Ok(())
    }

    async fn latest(
        &self,
        kind: GrainKind,
        identity: Uuid,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        // Later inserts win ties on `created_at`.
        Ok(rows.get(&(kind, identity)).and_then(|snapshots| {
            snapshots
                .iter()
                .enumerate()
                .max_by_key(|(index, s)| (s.created_at, *index))
                .map(|(_, s)| s.data.clone())
        }))
    }

    async fn identities(&self, kind: GrainKind) -> Result<Vec<Uuid>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, identity)| *identity)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_returns_most_recent_insert() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();

        store.insert(GrainKind::Inventory, id, vec![1]).await.unwrap();
        store.insert(GrainKind::Inventory, id, vec![2]).await.unwrap();

        assert_eq!(
            store.latest(GrainKind::Inventory, id).await.unwrap(),
            Some(vec![2])
        );
        assert_eq!(store.row_count(GrainKind::Inventory, id), 2);
        assert_eq!(store.latest(GrainKind::Timer, id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn identities_filters_by_kind() {
        let store = InMemoryStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        store.insert(GrainKind::Inventory, a, vec![]).await.unwrap();
        store.insert(GrainKind::Timer, b, vec![]).await.unwrap();

        assert_eq!(store.identities(GrainKind::Inventory).await.unwrap(), vec![a]);
    }
}
