// Per-process owner of local sessions.
//
// The registry maps each document to a slot guarded by its own mutex, so
// connects to one document are serialized while other documents proceed.
// Lock order is slot, then registry; the registry lock is never held while
// waiting on a slot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mapsync_common::protocol::session::{OutgoingMessage, RoutingHint};
use mapsync_common::types::DocumentId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::lease::{InstanceIdentity, LeaseBackend, LeaseError, LeaseGrant, ReleaseOutcome};
use crate::session::{
    shutdown_requested, CloseReason, Connection, Session, SessionConfig, SessionError,
    SessionHandle,
};
use crate::snapshot::SnapshotRepo;
use crate::store::{Document, Store, StoreError};
use crate::traffic::{TrafficLog, TrafficSink};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    pub identity: InstanceIdentity,
    pub lease_duration: Duration,
    /// Must be shorter than `lease_duration`.
    pub renew_interval: Duration,
    pub session: SessionConfig,
    /// Capture per-session traffic under this directory when set.
    pub traffic_dir: Option<PathBuf>,
}

impl MatchmakerConfig {
    pub fn new(identity: InstanceIdentity) -> Self {
        let lease_duration = Duration::from_secs(300);
        Self {
            identity,
            lease_duration,
            renew_interval: lease_duration / 4,
            session: SessionConfig::default(),
            traffic_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    /// Another live instance owns the document; retry there.
    #[error("document is owned by {owner_host}")]
    Routing { owner_host: String },
    #[error("lease backend failed: {0}")]
    Lease(#[from] LeaseError),
    #[error("could not load document: {0}")]
    Load(#[from] StoreError),
    #[error("session could not accept the client")]
    SessionUnavailable,
    #[error("server is shutting down")]
    ShuttingDown,
}

impl ConnectError {
    pub fn routing_hint(&self) -> Option<RoutingHint> {
        match self {
            Self::Routing { owner_host } => Some(RoutingHint { addr: owner_host.clone() }),
            _ => None,
        }
    }
}

enum Slot<C> {
    Vacant,
    Active(LocalSession<C>),
    /// Removed from the registry; holders of a stale `Arc` must look again.
    Retired,
}

struct LocalSession<C> {
    epoch: u64,
    handle: SessionHandle<C>,
}

type SlotRef<C> = Arc<Mutex<Slot<C>>>;

#[derive(Debug, Clone, Copy, Default)]
struct Lifecycle {
    shutting_down: bool,
    sessions: usize,
}

struct Inner<D: Document, L, R> {
    config: MatchmakerConfig,
    lease: L,
    repo: R,
    registry: Mutex<HashMap<DocumentId, SlotRef<D::Change>>>,
    next_epoch: AtomicU64,
    /// Admission gate and live session count, updated together.
    lifecycle: watch::Sender<Lifecycle>,
    /// Observed by sessions and renewers.
    shutdown: watch::Sender<bool>,
    traffic: Option<TrafficLog>,
}

/// Cheap to clone; clones share one registry.
pub struct Matchmaker<D: Document, L, R> {
    inner: Arc<Inner<D, L, R>>,
}

impl<D: Document, L, R> Clone for Matchmaker<D, L, R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<D: Document, L: LeaseBackend, R: SnapshotRepo> Matchmaker<D, L, R> {
    pub fn new(mut config: MatchmakerConfig, lease: L, repo: R) -> Self {
        if config.renew_interval.is_zero() || config.renew_interval >= config.lease_duration {
            let clamped = (config.lease_duration / 4).max(MIN_RENEW_INTERVAL);
            warn!(
                renew_interval_ms = config.renew_interval.as_millis() as u64,
                lease_duration_ms = config.lease_duration.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "lease renew interval must be shorter than the lease; clamping"
            );
            config.renew_interval = clamped;
        }
        let traffic = config.traffic_dir.as_ref().map(|dir| TrafficLog::new(dir, &config.identity));

        Self {
            inner: Arc::new(Inner {
                config,
                lease,
                repo,
                registry: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(1),
                lifecycle: watch::channel(Lifecycle::default()).0,
                shutdown: watch::channel(false).0,
                traffic,
            }),
        }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.inner.config.identity
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lifecycle.borrow().shutting_down
    }

    pub fn session_count(&self) -> usize {
        self.inner.lifecycle.borrow().sessions
    }

    /// Documents with a live local session.
    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let slots: Vec<(DocumentId, SlotRef<D::Change>)> = {
            let registry = self.inner.registry.lock().await;
            registry.iter().map(|(id, slot)| (*id, Arc::clone(slot))).collect()
        };

        let mut active = Vec::new();
        for (document_id, slot) in slots {
            if matches!(&*slot.lock().await, Slot::Active(_)) {
                active.push(document_id);
            }
        }
        active
    }

    /// Attach a client to the document's session, starting one if this
    /// instance can take the lease.
    ///
    /// `outbound` receives the welcome message before this returns, then every
    /// broadcast. Returns [`ConnectError::Routing`] when another instance owns
    /// the document.
    pub async fn connect(
        &self,
        document_id: DocumentId,
        outbound: mpsc::Sender<OutgoingMessage<D::Change>>,
    ) -> Result<Connection<D::Change>, ConnectError> {
        loop {
            if self.is_shutting_down() {
                return Err(ConnectError::ShuttingDown);
            }

            let slot = self.slot(document_id).await;
            let mut state = slot.lock().await;

            match &*state {
                Slot::Retired => continue,
                Slot::Vacant => {}
                Slot::Active(local) => {
                    let handle = local.handle.clone();
                    match handle.connect(outbound.clone()).await {
                        Ok(connection) => return Ok(connection),
                        Err(SessionError::Rejected) => return Err(ConnectError::SessionUnavailable),
                        Err(SessionError::Closed) => {
                            // Closing on its own; its supervisor is parked on
                            // this slot and will see a newer epoch.
                            debug!(document_id = %document_id, "waiting for closing session");
                            handle.closed().await;
                            *state = Slot::Vacant;
                        }
                    }
                }
            }

            return self.start_session(document_id, &slot, &mut state, outbound).await;
        }
    }

    /// Close every session, release their leases, and wait until none remain.
    /// Connects after this point fail with [`ConnectError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.inner.lifecycle.send_modify(|lifecycle| lifecycle.shutting_down = true);
        self.inner.shutdown.send_replace(true);
        info!(identity = %self.inner.config.identity, "matchmaker shutting down");

        let mut lifecycle = self.inner.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|lifecycle| lifecycle.sessions == 0).await;
        info!("all sessions closed");
    }

    async fn slot(&self, document_id: DocumentId) -> SlotRef<D::Change> {
        let mut registry = self.inner.registry.lock().await;
        Arc::clone(
            registry.entry(document_id).or_insert_with(|| Arc::new(Mutex::new(Slot::Vacant))),
        )
    }

    async fn start_session(
        &self,
        document_id: DocumentId,
        slot: &SlotRef<D::Change>,
        state: &mut Slot<D::Change>,
        outbound: mpsc::Sender<OutgoingMessage<D::Change>>,
    ) -> Result<Connection<D::Change>, ConnectError> {
        let config = &self.inner.config;

        match self.inner.lease.acquire_or_renew(document_id, &config.identity, config.lease_duration).await {
            Ok(LeaseGrant::Granted) => {
                info!(document_id = %document_id, run_id = %config.identity.run_id, "lease acquired");
            }
            Ok(LeaseGrant::Denied { owner_host, owner_run_id }) => {
                info!(
                    document_id = %document_id,
                    owner_host = %owner_host,
                    owner_run_id = %owner_run_id,
                    "document owned elsewhere"
                );
                self.retire(document_id, slot, state).await;
                return Err(ConnectError::Routing { owner_host });
            }
            Err(error) => {
                warn!(document_id = %document_id, error = %error, "lease acquire failed");
                self.retire(document_id, slot, state).await;
                return Err(error.into());
            }
        }

        let store = match Store::<D, R>::load(document_id, self.inner.repo.clone()).await {
            Ok(store) => store,
            Err(error) => {
                error!(document_id = %document_id, error = %error, "snapshot load failed");
                self.release(document_id).await;
                self.retire(document_id, slot, state).await;
                return Err(error.into());
            }
        };

        let admitted = self.inner.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.shutting_down {
                return false;
            }
            lifecycle.sessions += 1;
            true
        });
        if !admitted {
            self.release(document_id).await;
            self.retire(document_id, slot, state).await;
            return Err(ConnectError::ShuttingDown);
        }

        let traffic = self.inner.traffic.as_ref().map(|log| {
            let sink: Box<dyn TrafficSink> = Box::new(log.open(document_id));
            sink
        });
        let handle =
            Session::spawn(store, config.session.clone(), self.inner.shutdown.subscribe(), traffic);
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        *state = Slot::Active(LocalSession { epoch, handle: handle.clone() });

        tokio::spawn(
            self.clone()
                .supervise(document_id, epoch, Arc::clone(slot), handle.clone())
                .instrument(info_span!("mapsync.supervisor", document_id = %document_id)),
        );

        handle.connect(outbound).await.map_err(|_| ConnectError::SessionUnavailable)
    }

    /// Keeps the lease alive while the session runs, then hands ownership
    /// back once it has flushed.
    async fn supervise(
        self,
        document_id: DocumentId,
        epoch: u64,
        slot: SlotRef<D::Change>,
        handle: SessionHandle<D::Change>,
    ) {
        let (stop_renewing, stop) = oneshot::channel();
        let mut renewer = tokio::spawn(
            self.clone()
                .renew(document_id, handle.clone(), stop)
                .instrument(info_span!("mapsync.renewer", document_id = %document_id)),
        );

        let mut renewer_finished = false;
        let reason = tokio::select! {
            reason = handle.closed() => reason,
            finished = &mut renewer => {
                renewer_finished = true;
                if let Err(error) = finished {
                    error!(error = %error, "lease renewer died, closing session");
                    handle.terminate(CloseReason::LeaseUnrenewable);
                }
                handle.closed().await
            }
        };
        debug!(?reason, "session finished");

        // A renewal already sent must land before the release, or it would
        // recreate the lease behind it.
        if !renewer_finished {
            let _ = stop_renewing.send(());
            if let Err(error) = renewer.await {
                warn!(error = %error, "lease renewer failed while stopping");
            }
        }

        {
            let mut state = slot.lock().await;
            let current = matches!(&*state, Slot::Active(local) if local.epoch == epoch);
            if current {
                self.release(document_id).await;
                self.retire(document_id, &slot, &mut state).await;
            }
        }

        self.inner.lifecycle.send_modify(|lifecycle| {
            lifecycle.sessions = lifecycle.sessions.saturating_sub(1);
        });
    }

    async fn renew(
        self,
        document_id: DocumentId,
        handle: SessionHandle<D::Change>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let config = &self.inner.config;
        let every = config.renew_interval;
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut stop => return,
                _ = shutdown_requested(&mut shutdown) => {
                    debug!("lease renewal stopped for shutdown");
                    return;
                }
            }

            match self.inner.lease.acquire_or_renew(document_id, &config.identity, config.lease_duration).await {
                Ok(LeaseGrant::Granted) => {
                    last_renewed = Instant::now();
                    debug!("lease renewed");
                }
                Ok(LeaseGrant::Denied { owner_host, owner_run_id }) => {
                    warn!(owner_host = %owner_host, owner_run_id = %owner_run_id, "lease taken over, closing session");
                    handle.terminate(CloseReason::LeaseLost);
                    return;
                }
                Err(error) => {
                    // Give up while a lease we may still hold has at least one
                    // renewal interval left, never after it could have lapsed.
                    if last_renewed.elapsed() + every >= config.lease_duration {
                        error!(error = %error, "lease renewal keeps failing, closing session");
                        handle.terminate(CloseReason::LeaseUnrenewable);
                        return;
                    }
                    warn!(error = %error, "lease renewal failed, will retry");
                }
            }
        }
    }

    async fn release(&self, document_id: DocumentId) {
        match self.inner.lease.release(document_id, &self.inner.config.identity).await {
            Ok(ReleaseOutcome::Released) => info!(document_id = %document_id, "lease released"),
            Ok(ReleaseOutcome::NotHeld) => {
                debug!(document_id = %document_id, "lease already gone at release")
            }
            Err(error) => warn!(
                document_id = %document_id,
                error = %error,
                "lease release failed; it will expire on its own"
            ),
        }
    }

    /// Drop the slot from the registry. The caller holds the slot lock.
    async fn retire(&self, document_id: DocumentId, slot: &SlotRef<D::Change>, state: &mut Slot<D::Change>) {
        *state = Slot::Retired;
        let mut registry = self.inner.registry.lock().await;
        if registry.get(&document_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            registry.remove(&document_id);
        }
    }
}
