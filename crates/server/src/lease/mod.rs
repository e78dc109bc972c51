// Fleet-wide document ownership leases.
//
// At most one unexpired lease exists per document. Acquisition is a single
// conditional write in the backend (absent, expired, or already ours), never a
// read followed by a write. Only the holder may renew or release.

mod memory;
mod postgres;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use mapsync_common::types::DocumentId;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryLeaseBackend;
pub use postgres::PgLeaseBackend;

/// Who holds a lease: the address peers are redirected to plus a token that is
/// fresh on every process start, so a restarted process at the same address
/// does not mistake its predecessor's lease for its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentity {
    pub host: String,
    pub run_id: Uuid,
}

impl InstanceIdentity {
    pub fn new(host: impl Into<String>, run_id: Uuid) -> Self {
        Self { host: host.into(), run_id }
    }

    /// Identity for a freshly started process.
    pub fn fresh(host: impl Into<String>) -> Self {
        Self::new(host, Uuid::new_v4())
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.host, self.run_id)
    }
}

/// Result of an acquire-or-renew attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    /// The caller holds the lease until `now + duration`.
    Granted,
    /// A different live owner holds the lease.
    Denied { owner_host: String, owner_run_id: Uuid },
}

/// Result of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing to release: expired, taken over, or never held.
    NotHeld,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease backend query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("lease backend unavailable: {0}")]
    Unavailable(String),
}

/// Distributed lease store shared by every instance of the fleet.
pub trait LeaseBackend: Clone + Send + Sync + 'static {
    /// Atomically take or extend the lease for `document_id`.
    ///
    /// Succeeds when the lease is absent, expired, or already held by exactly
    /// `owner` (same host and run id).
    fn acquire_or_renew(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
        duration: Duration,
    ) -> impl Future<Output = Result<LeaseGrant, LeaseError>> + Send;

    /// Drop the lease if `owner` still holds it.
    fn release(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
    ) -> impl Future<Output = Result<ReleaseOutcome, LeaseError>> + Send;
}
