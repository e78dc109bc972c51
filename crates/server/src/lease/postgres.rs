// Postgres-backed document leases.
//
// Expiry is judged against the database clock so that instances with skewed
// clocks agree on when a lease has lapsed.

use std::time::Duration;

use mapsync_common::types::DocumentId;
use sqlx::PgPool;
use uuid::Uuid;

use super::{InstanceIdentity, LeaseBackend, LeaseError, LeaseGrant, ReleaseOutcome};

#[derive(Clone)]
pub struct PgLeaseBackend {
    pool: PgPool,
}

impl PgLeaseBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current unexpired owner of a document, if any.
    pub async fn current_owner(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<InstanceIdentity>, LeaseError> {
        let row = sqlx::query_as::<_, (String, Uuid)>(
            r#"
SELECT owner_host, owner_run_id
FROM document_leases
WHERE document_id = $1
  AND expires_at > now()
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(host, run_id)| InstanceIdentity { host, run_id }))
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn evict_expired(&self) -> Result<u64, LeaseError> {
        let deleted = sqlx::query(
            r#"
DELETE FROM document_leases
WHERE expires_at <= now()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

impl LeaseBackend for PgLeaseBackend {
    async fn acquire_or_renew(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError> {
        // One statement: the row lock taken by ON CONFLICT serializes racing
        // instances, and the CASE arms only hand the row over when it is
        // expired or already ours.
        let (owner_host, owner_run_id) = sqlx::query_as::<_, (String, Uuid)>(
            r#"
INSERT INTO document_leases (document_id, owner_host, owner_run_id, acquired_at, expires_at)
VALUES ($1, $2, $3, now(), now() + make_interval(secs => $4))
ON CONFLICT (document_id) DO UPDATE
SET owner_host = CASE
        WHEN document_leases.expires_at <= now() THEN EXCLUDED.owner_host
        ELSE document_leases.owner_host
    END,
    owner_run_id = CASE
        WHEN document_leases.expires_at <= now() THEN EXCLUDED.owner_run_id
        ELSE document_leases.owner_run_id
    END,
    acquired_at = CASE
        WHEN document_leases.expires_at <= now() THEN EXCLUDED.acquired_at
        ELSE document_leases.acquired_at
    END,
    expires_at = CASE
        WHEN document_leases.expires_at <= now()
            OR (document_leases.owner_host = EXCLUDED.owner_host
                AND document_leases.owner_run_id = EXCLUDED.owner_run_id)
            THEN EXCLUDED.expires_at
        ELSE document_leases.expires_at
    END
RETURNING owner_host, owner_run_id
            "#,
        )
        .bind(document_id)
        .bind(&owner.host)
        .bind(owner.run_id)
        .bind(duration.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        if owner_host == owner.host && owner_run_id == owner.run_id {
            Ok(LeaseGrant::Granted)
        } else {
            Ok(LeaseGrant::Denied { owner_host, owner_run_id })
        }
    }

    async fn release(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
    ) -> Result<ReleaseOutcome, LeaseError> {
        let deleted = sqlx::query(
            r#"
DELETE FROM document_leases
WHERE document_id = $1
  AND owner_host = $2
  AND owner_run_id = $3
  AND expires_at > now()
            "#,
        )
        .bind(document_id)
        .bind(&owner.host)
        .bind(owner.run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(if deleted == 1 { ReleaseOutcome::Released } else { ReleaseOutcome::NotHeld })
    }
}
