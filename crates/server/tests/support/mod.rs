#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mapsync_common::changeset::{Changeset, ChangesetError, YrsUpdate};
use mapsync_common::protocol::session::OutgoingMessage;
use mapsync_common::types::DocumentId;
use mapsync_server::lease::{
    InstanceIdentity, LeaseBackend, LeaseError, LeaseGrant, MemoryLeaseBackend, ReleaseOutcome,
};
use mapsync_server::matchmaker::{Matchmaker, MatchmakerConfig};
use mapsync_server::session::SessionConfig;
use mapsync_server::snapshot::{MemorySnapshotRepo, RepoError, SnapshotRepo};
use mapsync_server::store::{Document, DocumentError, YrsDocument};
use mapsync_server::traffic::{TrafficEntry, TrafficSink};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

pub const LEASE: Duration = Duration::from_secs(10);
pub const RENEW: Duration = Duration::from_secs(2);
pub const IDLE: Duration = Duration::from_secs(3);
pub const SAVE: Duration = Duration::from_secs(1);
pub const BROADCAST: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(60);

pub type YrsMatchmaker<L, R> = Matchmaker<YrsDocument, L, R>;
pub type Outbound<C> = mpsc::Receiver<OutgoingMessage<C>>;

pub fn session_config() -> SessionConfig {
    SessionConfig { idle_timeout: IDLE, save_interval: SAVE, broadcast_interval: BROADCAST }
}

pub fn instance_config(host: &str) -> MatchmakerConfig {
    MatchmakerConfig {
        identity: InstanceIdentity::fresh(host),
        lease_duration: LEASE,
        renew_interval: RENEW,
        session: session_config(),
        traffic_dir: None,
    }
}

pub fn outbound<C>() -> (mpsc::Sender<OutgoingMessage<C>>, Outbound<C>) {
    mpsc::channel(64)
}

/// Sink for a client that reads and ignores everything it is sent.
pub fn ignoring_client<C: Send + 'static>() -> mpsc::Sender<OutgoingMessage<C>> {
    let (tx, mut rx) = outbound();
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    tx
}

pub async fn recv<C>(rx: &mut Outbound<C>) -> OutgoingMessage<C> {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an outgoing message")
        .expect("outbound channel closed")
}

pub async fn recv_until<C>(
    rx: &mut Outbound<C>,
    predicate: impl Fn(&OutgoingMessage<C>) -> bool,
) -> OutgoingMessage<C> {
    loop {
        let message = recv(rx).await;
        if predicate(&message) {
            return message;
        }
    }
}

/// Drain until the session drops the sink; returns everything seen.
pub async fn drain_until_closed<C>(rx: &mut Outbound<C>) -> Vec<OutgoingMessage<C>> {
    let mut seen = Vec::new();
    loop {
        match timeout(WAIT, rx.recv()).await.expect("timed out waiting for sink to close") {
            Some(message) => seen.push(message),
            None => return seen,
        }
    }
}

/// Append `content` to the shared "title" text and return the delta.
pub fn edit(doc: &Doc, content: &str) -> YrsUpdate {
    let text = doc.get_or_insert_text("title");
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
    }
    YrsUpdate::new(doc.transact().encode_diff_v1(&before))
}

/// Title after applying `updates` to an empty document.
pub fn title_of<'a>(updates: impl IntoIterator<Item = &'a YrsUpdate>) -> String {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("title");
    {
        let mut txn = doc.transact_mut();
        for update in updates {
            let update = Update::decode_v1(update.as_bytes()).expect("valid update");
            txn.apply_update(update).expect("update applies");
        }
    }
    let txn = doc.transact();
    text.get_string(&txn)
}

pub async fn wait_for_no_sessions<L: LeaseBackend, R: SnapshotRepo>(matchmaker: &YrsMatchmaker<L, R>) {
    timeout(WAIT, async {
        while matchmaker.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions did not wind down");
}

/// Lease backend that can be switched into an outage.
#[derive(Debug, Clone, Default)]
pub struct FlakyLease {
    pub inner: MemoryLeaseBackend,
    down: Arc<AtomicBool>,
}

impl FlakyLease {
    pub fn over(inner: MemoryLeaseBackend) -> Self {
        Self { inner, down: Arc::default() }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable("lease store unreachable".into()));
        }
        Ok(())
    }
}

impl LeaseBackend for FlakyLease {
    async fn acquire_or_renew(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError> {
        self.check()?;
        self.inner.acquire_or_renew(document_id, owner, duration).await
    }

    async fn release(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
    ) -> Result<ReleaseOutcome, LeaseError> {
        self.check()?;
        self.inner.release(document_id, owner).await
    }
}

/// Grants the first acquire; every renewal after that takes a second and
/// lands even if the caller stops waiting, like a statement already sent to
/// the database.
#[derive(Debug, Clone, Default)]
pub struct SlowRenewals {
    pub inner: MemoryLeaseBackend,
    acquired: Arc<AtomicBool>,
}

impl LeaseBackend for SlowRenewals {
    async fn acquire_or_renew(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError> {
        if !self.acquired.swap(true, Ordering::SeqCst) {
            return self.inner.acquire_or_renew(document_id, owner, duration).await;
        }
        let inner = self.inner.clone();
        let owner = owner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            inner.acquire_or_renew(document_id, &owner, duration).await
        })
        .await
        .map_err(|error| LeaseError::Unavailable(error.to_string()))?
    }

    async fn release(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
    ) -> Result<ReleaseOutcome, LeaseError> {
        self.inner.release(document_id, owner).await
    }
}

/// Grants the first acquire and panics on every renewal.
#[derive(Debug, Clone, Default)]
pub struct PanickingRenewals {
    pub inner: MemoryLeaseBackend,
    acquired: Arc<AtomicBool>,
}

impl LeaseBackend for PanickingRenewals {
    async fn acquire_or_renew(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
        duration: Duration,
    ) -> Result<LeaseGrant, LeaseError> {
        if self.acquired.swap(true, Ordering::SeqCst) {
            panic!("renewal blew up");
        }
        self.inner.acquire_or_renew(document_id, owner, duration).await
    }

    async fn release(
        &self,
        document_id: DocumentId,
        owner: &InstanceIdentity,
    ) -> Result<ReleaseOutcome, LeaseError> {
        self.inner.release(document_id, owner).await
    }
}

/// Snapshot repo with switchable load and save failures.
#[derive(Debug, Clone, Default)]
pub struct FailingRepo {
    pub inner: MemorySnapshotRepo,
    fail_loads: Arc<AtomicBool>,
    fail_saves: Arc<AtomicBool>,
}

impl FailingRepo {
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl SnapshotRepo for FailingRepo {
    async fn get_snapshot(&self, document_id: DocumentId) -> Result<Option<Vec<u8>>, RepoError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("snapshot store unreachable".into()));
        }
        self.inner.get_snapshot(document_id).await
    }

    async fn set_snapshot(&self, document_id: DocumentId, snapshot: Vec<u8>) -> Result<(), RepoError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("disk full".into()));
        }
        self.inner.set_snapshot(document_id, snapshot).await
    }
}

/// A list of "set the level" operations; the last one wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Levels(pub Vec<i64>);

impl Changeset for Levels {
    fn merge(&mut self, other: &Self) -> Result<(), ChangesetError> {
        self.0.extend_from_slice(&other.0);
        Ok(())
    }
}

pub const MAX_LEVEL: i64 = 100;

/// Holds one level in `0..=MAX_LEVEL`. Levels above the cap are clamped and
/// answered with a correction; negative levels are rejected outright.
#[derive(Debug, Default)]
pub struct LevelDocument {
    pub level: i64,
}

impl Document for LevelDocument {
    type Change = Levels;

    fn from_snapshot(snapshot: Option<&[u8]>) -> Result<Self, DocumentError> {
        let Some(bytes) = snapshot else {
            return Ok(Self::default());
        };
        let bytes: [u8; 8] =
            bytes.try_into().map_err(|_| DocumentError::Decode("expected 8 bytes".into()))?;
        Ok(Self { level: i64::from_le_bytes(bytes) })
    }

    fn update(&mut self, change: &Levels) -> Result<Option<Levels>, DocumentError> {
        if change.0.iter().any(|level| *level < 0) {
            return Err(DocumentError::Rejected("levels cannot be negative".into()));
        }
        let Some(last) = change.0.last().copied() else {
            return Ok(None);
        };
        if last > MAX_LEVEL {
            self.level = MAX_LEVEL;
            return Ok(Some(Levels(vec![MAX_LEVEL])));
        }
        self.level = last;
        Ok(None)
    }

    fn to_changeset(&self) -> Levels {
        Levels(vec![self.level])
    }

    fn to_snapshot(&self) -> Vec<u8> {
        self.level.to_le_bytes().to_vec()
    }
}

/// Traffic sink that keeps entries in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub entries: Arc<Mutex<Vec<TrafficEntry>>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<TrafficEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl TrafficSink for RecordingSink {
    fn record(&mut self, entry: TrafficEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}
