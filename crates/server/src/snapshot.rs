// Durable snapshot storage keyed by document id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use mapsync_common::types::DocumentId;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("snapshot query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store for serialized document snapshots.
pub trait SnapshotRepo: Clone + Send + Sync + 'static {
    /// Latest snapshot, or `None` for a document that was never saved.
    fn get_snapshot(
        &self,
        document_id: DocumentId,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, RepoError>> + Send;

    fn set_snapshot(
        &self,
        document_id: DocumentId,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), RepoError>> + Send;
}

#[derive(Clone)]
pub struct PgSnapshotRepo {
    pool: PgPool,
}

impl PgSnapshotRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SnapshotRepo for PgSnapshotRepo {
    async fn get_snapshot(&self, document_id: DocumentId) -> Result<Option<Vec<u8>>, RepoError> {
        let snapshot = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
SELECT snapshot
FROM map_snapshots
WHERE document_id = $1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(snapshot)
    }

    async fn set_snapshot(&self, document_id: DocumentId, snapshot: Vec<u8>) -> Result<(), RepoError> {
        sqlx::query(
            r#"
INSERT INTO map_snapshots (document_id, snapshot, updated_at)
VALUES ($1, $2, now())
ON CONFLICT (document_id) DO UPDATE
SET snapshot = EXCLUDED.snapshot,
    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(document_id)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotRepo {
    snapshots: Arc<RwLock<HashMap<DocumentId, Vec<u8>>>>,
}

impl MemorySnapshotRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

impl SnapshotRepo for MemorySnapshotRepo {
    async fn get_snapshot(&self, document_id: DocumentId) -> Result<Option<Vec<u8>>, RepoError> {
        Ok(self.snapshots.read().await.get(&document_id).cloned())
    }

    async fn set_snapshot(&self, document_id: DocumentId, snapshot: Vec<u8>) -> Result<(), RepoError> {
        self.snapshots.write().await.insert(document_id, snapshot);
        Ok(())
    }
}
