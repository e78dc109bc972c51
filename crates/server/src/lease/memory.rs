// In-process lease table, for single-instance deployments and for tests that
// simulate a fleet by sharing one table between several matchmakers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mapsync_common::types::DocumentId;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{InstanceIdentity, LeaseBackend, LeaseError, LeaseGrant, ReleaseOutcome};

#[derive(Debug, Clone)]
struct MemoryLease {
    owner: InstanceIdentity,
    expires_at: Instant,
}

/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseBackend {
    leases: Arc<Mutex<HashMap<DocumentId, MemoryLease>>>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired owner, if any.
    pub async fn current_owner(&self, document_id: DocumentId) -> Option<InstanceIdentity> {
        let now = Instant::now();
        self.leases
            .lock()
            .await
            .get(&document_id)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone())
    }

    /// Number of unexpired leases.
    pub async fn active_count(&self) -> usize {
        let now = Instant::now();
        self.leases.lock().await.values().filter(|lease| lease.expires_at > now).count()
    }
}

impl LeaseBackend for MemoryLeaseBackend {
    async fn acquire_or_renew(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(existing) = leases.get(&document_id) {
            if existing.expires_at > now && existing.owner != *owner {
                return Ok(LeaseGrant::Denied {
                    owner_host: existing.owner.host.clone(),
                    owner_run_id: existing.owner.run_id,
                });
            }
        }

        leases.insert(document_id, MemoryLease { owner: owner.clone(), expires_at: now + duration });
        Ok(LeaseGrant::Granted)
    }

    async fn release(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
    ) -> Result<ReleaseOutcome, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        match leases.get(&document_id) {
            Some(lease) if lease.owner == *owner && lease.expires_at > now => {
                leases.remove(&document_id);
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotHeld),
        }
    }
}
