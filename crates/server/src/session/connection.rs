use mapsync_common::protocol::session::IncomingMessage;
use mapsync_common::types::ClientId;
use tokio::sync::mpsc;

use super::SessionError;

/// A client's attachment to a running session.
///
/// Dropping the connection disconnects the client, so a transport that exits
/// early cannot leave a stale entry behind in the session.
pub struct Connection<C> {
    client_id: ClientId,
    inbound: mpsc::Sender<(ClientId, IncomingMessage<C>)>,
    disconnect: mpsc::UnboundedSender<ClientId>,
}

impl<C> Connection<C> {
    pub(super) fn new(
        client_id: ClientId,
        inbound: mpsc::Sender<(ClientId, IncomingMessage<C>)>,
        disconnect: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        Self { client_id, inbound, disconnect }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Queue a message for the session loop. Waits when the session is
    /// behind; fails once the session has stopped.
    pub async fn send(&self, message: IncomingMessage<C>) -> Result<(), SessionError> {
        self.inbound.send((self.client_id, message)).await.map_err(|_| SessionError::Closed)
    }

    pub fn disconnect(self) {}
}

impl<C> Drop for Connection<C> {
    fn drop(&mut self) {
        let _ = self.disconnect.send(self.client_id);
    }
}

impl<C> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("client_id", &self.client_id).finish_non_exhaustive()
    }
}
