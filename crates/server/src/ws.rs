// WebSocket edge: one socket per client, JSON text frames in both directions.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use mapsync_common::protocol::session::{
    ErrorPayload, IncomingMessage, OutgoingMessage, INVALID_MESSAGE, SHUTTING_DOWN,
};
use mapsync_common::types::DocumentId;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lease::LeaseBackend;
use crate::matchmaker::{ConnectError, Matchmaker};
use crate::snapshot::SnapshotRepo;
use crate::store::Document;

pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// WebSocket close reasons are capped at 123 bytes.
const MAX_CLOSE_REASON_BYTES: usize = 123;

pub struct SyncState<D: Document, L, R> {
    matchmaker: Matchmaker<D, L, R>,
    outbound_buffer: usize,
}

impl<D: Document, L, R> Clone for SyncState<D, L, R> {
    fn clone(&self) -> Self {
        Self { matchmaker: self.matchmaker.clone(), outbound_buffer: self.outbound_buffer }
    }
}

pub fn router<D, L, R>(matchmaker: Matchmaker<D, L, R>, outbound_buffer: usize) -> Router
where
    D: Document,
    L: LeaseBackend,
    R: SnapshotRepo,
{
    let state = SyncState { matchmaker, outbound_buffer: outbound_buffer.max(1) };

    Router::new()
        .route("/healthz", get(healthz::<D, L, R>))
        .route("/maps/{document_id}/sync", get(sync_upgrade::<D, L, R>))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    host: String,
    run_id: String,
    sessions: usize,
}

async fn healthz<D, L, R>(State(state): State<SyncState<D, L, R>>) -> impl IntoResponse
where
    D: Document,
    L: LeaseBackend,
    R: SnapshotRepo,
{
    let identity = state.matchmaker.identity();
    let status = if state.matchmaker.is_shutting_down() { "draining" } else { "ok" };
    Json(Health {
        status,
        host: identity.host.clone(),
        run_id: identity.run_id.to_string(),
        sessions: state.matchmaker.session_count(),
    })
}

async fn sync_upgrade<D, L, R>(
    State(state): State<SyncState<D, L, R>>,
    Path(document_id): Path<DocumentId>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse
where
    D: Document,
    L: LeaseBackend,
    R: SnapshotRepo,
{
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, document_id, socket))
}

async fn handle_socket<D, L, R>(state: SyncState<D, L, R>, document_id: DocumentId, mut socket: WebSocket)
where
    D: Document,
    L: LeaseBackend,
    R: SnapshotRepo,
{
    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.outbound_buffer);
    let connection = match state.matchmaker.connect(document_id, outbound_tx).await {
        Ok(connection) => connection,
        Err(error) => {
            info!(document_id = %document_id, error = %error, "sync connect refused");
            let _ = socket.send(Message::Close(Some(connect_error_frame(&error)))).await;
            return;
        }
    };
    let client_id = connection.client_id();
    debug!(document_id = %document_id, client_id = %client_id, "sync socket attached");

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                let Some(outbound) = maybe_outbound else {
                    // The session dropped this client: it fell behind or the
                    // session closed.
                    let _ = socket.send(Message::Close(Some(close_frame(close_code::AGAIN, "session ended")))).await;
                    break;
                };
                let terminal = outbound.error.as_ref().filter(|error| error.terminal).cloned();
                if send_json(&mut socket, &outbound).await.is_err() {
                    break;
                }
                if let Some(error) = terminal {
                    let code = if error.code == SHUTTING_DOWN { close_code::AWAY } else { close_code::ERROR };
                    let _ = socket.send(Message::Close(Some(close_frame(code, &error.code)))).await;
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };

                match message {
                    Message::Text(raw) => {
                        match serde_json::from_str::<IncomingMessage<D::Change>>(&raw) {
                            Ok(incoming) => {
                                if connection.send(incoming).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                warn!(client_id = %client_id, error = %error, "invalid sync frame");
                                let reply = OutgoingMessage::<D::Change>::error(ErrorPayload::new(
                                    INVALID_MESSAGE,
                                    error.to_string(),
                                    false,
                                ));
                                if send_json(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    connection.disconnect();
    debug!(document_id = %document_id, client_id = %client_id, "sync socket detached");
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, message: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

/// Routing errors tell the client where to go: close 1013 with a JSON
/// `{"addr": ...}` reason.
fn connect_error_frame(error: &ConnectError) -> CloseFrame {
    if let Some(hint) = error.routing_hint() {
        let reason = serde_json::to_string(&hint).unwrap_or_default();
        return close_frame(close_code::AGAIN, &reason);
    }
    match error {
        ConnectError::ShuttingDown => close_frame(close_code::AWAY, &error.to_string()),
        _ => close_frame(close_code::ERROR, &error.to_string()),
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame { code, reason: truncate_reason(reason).into() }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
