// Per-document actor.
//
// One task owns the document and every client attached to it. All mutation
// happens inside `Session::run`, one event at a time, so nothing here is
// locked. Outbound delivery never waits: a client whose buffer is full is
// dropped rather than allowed to stall its peers.

mod connection;

use std::collections::HashMap;
use std::time::Duration;

use mapsync_common::changeset::{Changeset, ChangesetError};
use mapsync_common::protocol::session::{
    ErrorPayload, IncomingMessage, OutgoingMessage, INVALID_CHANGESET, LEASE_LOST, SAVE_FAILED,
    SESSION_FAILED, SHUTTING_DOWN,
};
use mapsync_common::types::{Awareness, ClientId, DocumentId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use connection::Connection;

use crate::snapshot::SnapshotRepo;
use crate::store::{Document, Store, StoreError};
use crate::traffic::{TrafficEntry, TrafficSink};

const CONNECT_QUEUE: usize = 32;
const INBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a session may sit with zero clients before it closes.
    pub idle_timeout: Duration,
    pub save_interval: Duration,
    /// Debounce window for fan-out of accumulated changes.
    pub broadcast_interval: Duration,
}

impl SessionConfig {
    /// Zero periods would panic the session's timers; fall back to defaults.
    fn with_nonzero_intervals(mut self) -> Self {
        let defaults = Self::default();
        if self.save_interval.is_zero() {
            warn!("zero save interval, using {:?}", defaults.save_interval);
            self.save_interval = defaults.save_interval;
        }
        if self.broadcast_interval.is_zero() {
            warn!("zero broadcast interval, using {:?}", defaults.broadcast_interval);
            self.broadcast_interval = defaults.broadcast_interval;
        }
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            save_interval: Duration::from_secs(60),
            broadcast_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Shutdown,
    /// Another instance took the lease over.
    LeaseLost,
    /// Renewals kept failing; the lease is still ours but about to lapse.
    LeaseUnrenewable,
    SaveFailed,
    Internal,
}

impl CloseReason {
    /// The message every remaining client gets before its sink is closed.
    fn terminal_error(self) -> Option<ErrorPayload> {
        match self {
            Self::Idle => None,
            Self::Shutdown => {
                Some(ErrorPayload::new(SHUTTING_DOWN, "server is shutting down", true))
            }
            Self::LeaseLost | Self::LeaseUnrenewable => Some(ErrorPayload::new(
                LEASE_LOST,
                "this server no longer owns the map; reconnect",
                true,
            )),
            Self::SaveFailed => {
                Some(ErrorPayload::new(SAVE_FAILED, "map could not be saved", true))
            }
            Self::Internal => Some(ErrorPayload::new(SESSION_FAILED, "map session failed", true)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Closing(CloseReason),
    Closed(CloseReason),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("client sink did not accept the welcome message")]
    Rejected,
}

struct ConnectRequest<C> {
    outbound: mpsc::Sender<OutgoingMessage<C>>,
    reply: oneshot::Sender<Result<Connection<C>, SessionError>>,
}

/// Cloneable address of a running session.
pub struct SessionHandle<C> {
    document_id: DocumentId,
    connect: mpsc::Sender<ConnectRequest<C>>,
    terminate: mpsc::UnboundedSender<CloseReason>,
    state: watch::Receiver<SessionState>,
}

impl<C> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            document_id: self.document_id,
            connect: self.connect.clone(),
            terminate: self.terminate.clone(),
            state: self.state.clone(),
        }
    }
}

impl<C: Changeset> SessionHandle<C> {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Attach a new client. The welcome message (full document plus current
    /// awareness) is already queued on `outbound` when this returns.
    pub async fn connect(
        &self,
        outbound: mpsc::Sender<OutgoingMessage<C>>,
    ) -> Result<Connection<C>, SessionError> {
        let (reply, accepted) = oneshot::channel();
        self.connect
            .send(ConnectRequest { outbound, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        accepted.await.map_err(|_| SessionError::Closed)?
    }

    /// Ask the session to close. No-op if it is already closing.
    pub fn terminate(&self, reason: CloseReason) {
        let _ = self.terminate.send(reason);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves once the final save has been attempted and every client sink
    /// has been dropped.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        let result = state.wait_for(|state| matches!(state, SessionState::Closed(_))).await;
        match result.as_deref() {
            Ok(SessionState::Closed(reason)) => *reason,
            // The task is gone without reporting, which only happens on panic.
            _ => CloseReason::Internal,
        }
    }
}

struct ClientState<C> {
    last_seq: Option<i64>,
    awareness: Awareness,
    outbound: mpsc::Sender<OutgoingMessage<C>>,
}

/// The actor itself. Built by [`Session::spawn`] and never touched from
/// outside its task.
pub struct Session<D: Document, R> {
    store: Store<D, R>,
    config: SessionConfig,
    clients: HashMap<ClientId, ClientState<D::Change>>,
    /// Changes accepted since the last broadcast, merged in arrival order.
    unsent: Option<D::Change>,
    /// Acks or awareness changed since the last broadcast.
    presence_changed: bool,
    /// Document changed since the last snapshot handed to a save.
    dirty: bool,
    idle_deadline: Instant,
    traffic: Option<Box<dyn TrafficSink>>,
    inbound_tx: mpsc::Sender<(ClientId, IncomingMessage<D::Change>)>,
    disconnect_tx: mpsc::UnboundedSender<ClientId>,
    state: watch::Sender<SessionState>,
}

struct Mailboxes<C> {
    connect: mpsc::Receiver<ConnectRequest<C>>,
    inbound: mpsc::Receiver<(ClientId, IncomingMessage<C>)>,
    disconnect: mpsc::UnboundedReceiver<ClientId>,
    terminate: mpsc::UnboundedReceiver<CloseReason>,
    shutdown: watch::Receiver<bool>,
}

impl<D: Document, R: SnapshotRepo> Session<D, R> {
    /// Start the loop for an already loaded store. The session closes on its
    /// own when idle, when `shutdown` flips to true, or when terminated
    /// through the handle.
    pub fn spawn(
        store: Store<D, R>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
        traffic: Option<Box<dyn TrafficSink>>,
    ) -> SessionHandle<D::Change> {
        let document_id = store.document_id();
        let config = config.with_nonzero_intervals();
        let (connect_tx, connect_rx) = mpsc::channel(CONNECT_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Running);

        let session = Self {
            store,
            idle_deadline: Instant::now() + config.idle_timeout,
            config,
            clients: HashMap::new(),
            unsent: None,
            presence_changed: false,
            dirty: false,
            traffic,
            inbound_tx,
            disconnect_tx,
            state: state_tx,
        };
        let mailboxes = Mailboxes {
            connect: connect_rx,
            inbound: inbound_rx,
            disconnect: disconnect_rx,
            terminate: terminate_rx,
            shutdown,
        };

        tokio::spawn(
            session
                .run(mailboxes)
                .instrument(info_span!("mapsync.session", document_id = %document_id)),
        );

        SessionHandle { document_id, connect: connect_tx, terminate: terminate_tx, state: state_rx }
    }

    async fn run(mut self, mut mailboxes: Mailboxes<D::Change>) {
        info!("session started");

        let mut broadcast_tick = interval(self.config.broadcast_interval);
        broadcast_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut save_tick = interval_at(
            Instant::now() + self.config.save_interval,
            self.config.save_interval,
        );
        save_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut saves: JoinSet<Result<(), StoreError>> = JoinSet::new();

        let reason = loop {
            tokio::select! {
                Some(request) = mailboxes.connect.recv() => self.on_connect(request),
                Some(client_id) = mailboxes.disconnect.recv() => self.on_disconnect(client_id),
                Some((client_id, message)) = mailboxes.inbound.recv() => {
                    if let Err(error) = self.on_message(client_id, message) {
                        error!(error = %error, "could not merge pending changes");
                        break CloseReason::Internal;
                    }
                }
                _ = broadcast_tick.tick() => self.broadcast(),
                _ = sleep_until(self.idle_deadline) => {
                    if self.clients.is_empty() {
                        break CloseReason::Idle;
                    }
                    self.idle_deadline = Instant::now() + self.config.idle_timeout;
                }
                _ = save_tick.tick() => {
                    if self.dirty && saves.is_empty() {
                        saves.spawn(self.store.checkpoint());
                        self.dirty = false;
                    }
                }
                Some(result) = saves.join_next() => {
                    if !self.on_save_finished(result) {
                        break CloseReason::SaveFailed;
                    }
                }
                Some(reason) = mailboxes.terminate.recv() => break reason,
                _ = shutdown_requested(&mut mailboxes.shutdown) => break CloseReason::Shutdown,
            }
        };

        // Stop accepting work before flushing so pending connects fail fast.
        drop(mailboxes);
        self.close(reason, saves).await;
    }

    fn on_connect(&mut self, request: ConnectRequest<D::Change>) {
        // Flush what peers have not seen yet; the welcome snapshot already
        // contains it.
        self.broadcast();

        let client_id = Uuid::new_v4();
        self.clients.insert(
            client_id,
            ClientState {
                last_seq: None,
                awareness: Awareness::Null,
                outbound: request.outbound,
            },
        );

        // The newcomer sees its own (empty) awareness entry.
        let welcome = OutgoingMessage {
            acks: None,
            awareness: Some(self.awareness_map()),
            change: Some(self.store.to_changeset()),
            error: None,
        };
        self.record(|| TrafficEntry::reply(client_id, &welcome));
        let delivered = self
            .clients
            .get(&client_id)
            .is_some_and(|client| client.outbound.try_send(welcome).is_ok());
        if !delivered {
            warn!(client_id = %client_id, "client sink refused welcome message");
            self.clients.remove(&client_id);
            let _ = request.reply.send(Err(SessionError::Rejected));
            return;
        }
        self.presence_changed = true;
        info!(client_id = %client_id, clients = self.clients.len(), "client connected");

        let connection =
            Connection::new(client_id, self.inbound_tx.clone(), self.disconnect_tx.clone());
        // A caller that gave up waiting drops the connection, which queues
        // the matching disconnect.
        let _ = request.reply.send(Ok(connection));
    }

    fn on_disconnect(&mut self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_some() {
            info!(client_id = %client_id, clients = self.clients.len(), "client disconnected");
            self.presence_changed = true;
            self.reset_idle_if_empty();
        }
    }

    fn on_message(
        &mut self,
        client_id: ClientId,
        message: IncomingMessage<D::Change>,
    ) -> Result<(), ChangesetError> {
        self.record(|| TrafficEntry::incoming(client_id, &message));

        let Some(client) = self.clients.get_mut(&client_id) else {
            debug!(client_id = %client_id, "message from departed client ignored");
            return Ok(());
        };

        if let Some(last) = client.last_seq {
            if message.seq <= last {
                warn!(client_id = %client_id, seq = message.seq, last_seq = last, "stale sequence number");
                self.reply(client_id, OutgoingMessage::error(ErrorPayload::stale_seq(message.seq, last)));
                return Ok(());
            }
        }

        client.last_seq = Some(message.seq);
        if let Some(awareness) = message.awareness {
            client.awareness = awareness;
        }
        self.presence_changed = true;

        let Some(change) = message.change else {
            return Ok(());
        };

        match self.store.update(&change) {
            Ok(correction) => {
                self.dirty = true;
                self.push_unsent(&change)?;
                if let Some(correction) = correction {
                    debug!(client_id = %client_id, "edit corrected");
                    self.push_unsent(&correction)?;
                    self.reply(client_id, OutgoingMessage::change(correction));
                }
            }
            Err(error) => {
                warn!(client_id = %client_id, seq = message.seq, error = %error, "edit rejected");
                self.reply(
                    client_id,
                    OutgoingMessage::error(ErrorPayload::new(
                        INVALID_CHANGESET,
                        error.to_string(),
                        false,
                    )),
                );
            }
        }

        Ok(())
    }

    fn push_unsent(&mut self, change: &D::Change) -> Result<(), ChangesetError> {
        match self.unsent.as_mut() {
            Some(unsent) => unsent.merge(change),
            None => {
                self.unsent = Some(change.clone());
                Ok(())
            }
        }
    }

    /// Returns false when the save failed.
    fn on_save_finished(
        &mut self,
        result: Result<Result<(), StoreError>, tokio::task::JoinError>,
    ) -> bool {
        match result {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                error!(error = %error, "checkpoint failed");
                self.dirty = true;
                false
            }
            Err(error) => {
                error!(error = %error, "checkpoint task failed");
                self.dirty = true;
                false
            }
        }
    }

    fn broadcast(&mut self) {
        if self.clients.is_empty() {
            self.presence_changed = false;
            self.unsent = None;
            return;
        }
        if !self.presence_changed && self.unsent.is_none() {
            return;
        }

        let acks = self
            .clients
            .iter()
            .filter_map(|(id, client)| client.last_seq.map(|seq| (*id, seq)))
            .collect();
        let message = OutgoingMessage {
            acks: Some(acks),
            awareness: Some(self.awareness_map()),
            change: self.unsent.take(),
            error: None,
        };
        self.presence_changed = false;
        self.record(|| TrafficEntry::broadcast(&message));

        let failed: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.outbound.try_send(message.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for client_id in failed {
            self.drop_client(client_id);
        }
    }

    fn reply(&mut self, client_id: ClientId, message: OutgoingMessage<D::Change>) {
        self.record(|| TrafficEntry::reply(client_id, &message));
        let delivered = self
            .clients
            .get(&client_id)
            .is_some_and(|client| client.outbound.try_send(message).is_ok());
        if !delivered {
            self.drop_client(client_id);
        }
    }

    fn drop_client(&mut self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_some() {
            warn!(client_id = %client_id, "client sink full or closed, dropping client");
            self.presence_changed = true;
            self.reset_idle_if_empty();
        }
    }

    fn reset_idle_if_empty(&mut self) {
        if self.clients.is_empty() {
            self.idle_deadline = Instant::now() + self.config.idle_timeout;
        }
    }

    fn awareness_map(&self) -> HashMap<ClientId, Awareness> {
        self.clients.iter().map(|(id, client)| (*id, client.awareness.clone())).collect()
    }

    fn record(&mut self, entry: impl FnOnce() -> TrafficEntry) {
        if let Some(sink) = self.traffic.as_mut() {
            sink.record(entry());
        }
    }

    async fn close(mut self, reason: CloseReason, mut saves: JoinSet<Result<(), StoreError>>) {
        self.state.send_replace(SessionState::Closing(reason));
        info!(?reason, clients = self.clients.len(), "session closing");

        if reason != CloseReason::Internal {
            self.broadcast();
        }
        if let Some(payload) = reason.terminal_error() {
            let message = OutgoingMessage::error(payload);
            self.record(|| TrafficEntry::broadcast(&message));
            for client in self.clients.values() {
                let _ = client.outbound.try_send(message.clone());
            }
        }

        while let Some(result) = saves.join_next().await {
            self.on_save_finished(result);
        }

        if self.dirty {
            if reason == CloseReason::LeaseLost {
                // Another instance may already own the map; writing now could
                // overwrite its snapshot.
                warn!("lease lost with unsaved changes, skipping final save");
            } else if let Err(error) = self.store.save().await {
                error!(error = %error, "final save failed");
            }
        }

        self.clients.clear();
        self.traffic = None;
        self.state.send_replace(SessionState::Closed(reason));
        info!(?reason, "session closed");
    }
}

/// Resolves when shutdown is requested; pends forever if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn to_value<T: Serialize>(message: &T) -> serde_json::Value {
    serde_json::to_value(message).unwrap_or(serde_json::Value::Null)
}

impl TrafficEntry {
    fn incoming<C: Serialize>(from: ClientId, message: &IncomingMessage<C>) -> Self {
        Self::Incoming { from, message: to_value(message) }
    }

    fn reply<C: Serialize>(to: ClientId, message: &OutgoingMessage<C>) -> Self {
        Self::Reply { to, message: to_value(message) }
    }

    fn broadcast<C: Serialize>(message: &OutgoingMessage<C>) -> Self {
        Self::Broadcast { message: to_value(message) }
    }
}
