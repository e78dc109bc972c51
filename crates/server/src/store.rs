// Bridge between a session's in-memory document and durable snapshots.

use std::future::Future;

use mapsync_common::changeset::{Changeset, YrsUpdate};
use mapsync_common::types::DocumentId;
use thiserror::Error;
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::snapshot::{RepoError, SnapshotRepo};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("cannot decode document data: {0}")]
    Decode(String),
    #[error("edit rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("stored snapshot is unusable: {0}")]
    Document(#[from] DocumentError),
}

/// The mutable state of one map, owned by exactly one session loop.
pub trait Document: Sized + Send + Sync + 'static {
    type Change: Changeset;

    /// Rebuild a document from its last snapshot; `None` means a brand new map.
    fn from_snapshot(snapshot: Option<&[u8]>) -> Result<Self, DocumentError>;

    /// Apply a client edit.
    ///
    /// Returns `Some(correction)` when the edit could not be applied exactly as
    /// sent; the correction must be applied by the sender and every peer after
    /// the original. Errors mean the edit was not applied at all.
    fn update(&mut self, change: &Self::Change) -> Result<Option<Self::Change>, DocumentError>;

    /// The whole document expressed as one changeset, sent to new clients.
    fn to_changeset(&self) -> Self::Change;

    fn to_snapshot(&self) -> Vec<u8>;
}

/// A Yjs document. CRDT merges never need correcting, so `update` only fails
/// on payloads that do not decode or integrate.
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for YrsDocument {
    type Change = YrsUpdate;

    fn from_snapshot(snapshot: Option<&[u8]>) -> Result<Self, DocumentError> {
        let document = Self::new();
        if let Some(bytes) = snapshot.filter(|bytes| !bytes.is_empty()) {
            let update =
                Update::decode_v1(bytes).map_err(|error| DocumentError::Decode(error.to_string()))?;
            document
                .doc
                .transact_mut()
                .apply_update(update)
                .map_err(|error| DocumentError::Decode(error.to_string()))?;
        }
        Ok(document)
    }

    fn update(&mut self, change: &YrsUpdate) -> Result<Option<YrsUpdate>, DocumentError> {
        let update = Update::decode_v1(change.as_bytes())
            .map_err(|error| DocumentError::Decode(error.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|error| DocumentError::Rejected(error.to_string()))?;
        Ok(None)
    }

    fn to_changeset(&self) -> YrsUpdate {
        YrsUpdate::new(self.to_snapshot())
    }

    fn to_snapshot(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }
}

/// One loaded document plus the repo it checkpoints to.
pub struct Store<D, R> {
    document_id: DocumentId,
    document: D,
    repo: R,
}

impl<D: Document, R: SnapshotRepo> Store<D, R> {
    /// Load the persisted snapshot; a missing snapshot yields an empty document.
    pub async fn load(document_id: DocumentId, repo: R) -> Result<Self, StoreError> {
        let snapshot = repo.get_snapshot(document_id).await?;
        debug!(
            document_id = %document_id,
            snapshot_bytes = snapshot.as_ref().map_or(0, Vec::len),
            "loaded snapshot"
        );
        let document = D::from_snapshot(snapshot.as_deref())?;
        Ok(Self { document_id, document, repo })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn update(&mut self, change: &D::Change) -> Result<Option<D::Change>, DocumentError> {
        self.document.update(change)
    }

    pub fn to_changeset(&self) -> D::Change {
        self.document.to_changeset()
    }

    pub fn to_snapshot(&self) -> Vec<u8> {
        self.document.to_snapshot()
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        self.checkpoint().await
    }

    /// Capture the current snapshot and return a detached future that writes
    /// it, so the write can run off the session loop.
    pub fn checkpoint(&self) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let repo = self.repo.clone();
        let document_id = self.document_id;
        let snapshot = self.to_snapshot();
        async move {
            let bytes = snapshot.len();
            repo.set_snapshot(document_id, snapshot).await?;
            debug!(document_id = %document_id, snapshot_bytes = bytes, "saved snapshot");
            Ok(())
        }
    }
}
