//! Connection lifecycle: dialing, the accept loop, per-connection receive
//! loops and disconnect handling.

use iroh::NodeId;
use n0_future::{
    boxed::BoxFuture,
    task::{self, AbortOnDropHandle},
};
use tracing::{debug, error, info, warn};

use super::{
    event::PeerEvent,
    message::ProtocolMessage,
    transport::{Connection, RecvStream, SendStream, Transport},
    PeerManager,
};
use crate::error::{ChatError, Result, TransportError};

impl<T: Transport> PeerManager<T> {
    /// Dial `node_id`, introduce ourselves with a `Join` and start serving the
    /// connection.
    ///
    /// Does nothing if the peer is ourselves, already connected, or being
    /// dialed. Failures are published as error events; they are returned only
    /// when `throw_on_error` is set.
    pub fn connect_to_peer(&self, node_id: NodeId, throw_on_error: bool) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            this.ensure_open()?;
            if node_id == this.node_id() || !this.begin_connect(node_id) {
                return Ok(());
            }
            let res = this.dial(node_id).await;
            this.state().pending.remove(&node_id);

            let Err(err) = res else {
                return Ok(());
            };
            if this.is_closed() {
                return Err(ChatError::Closed);
            }
            error!("failed to connect to {}: {err}", node_id.fmt_short());
            this.publish(PeerEvent::error(&err));
            if throw_on_error {
                Err(err)
            } else {
                Ok(())
            }
        })
    }

    async fn dial(&self, node_id: NodeId) -> Result<()> {
        let conn = self.inner.transport.connect(node_id).await?;
        let tracked = self.register(&conn);
        if !tracked {
            debug!("already connected to {}, keeping both legs", node_id.fmt_short());
        }

        let join = ProtocolMessage::join(self.node_id(), self.nickname());
        match self.exchange(&conn, &join).await {
            Ok(reply) => {
                info!("connected to {}", node_id.fmt_short());
                if let Some(reply) = reply {
                    self.handle_message(node_id, reply);
                }
                self.spawn_receive_loop(conn);
                Ok(())
            }
            Err(err) => {
                if tracked {
                    self.unregister(&conn);
                }
                conn.close(1, b"join failed");
                Err(err)
            }
        }
    }

    /// One request on a fresh bi-stream.
    ///
    /// The reply is best effort: an empty, unreadable or undecodable answer
    /// yields `None`.
    pub(super) async fn exchange(
        &self,
        conn: &T::Connection,
        message: &ProtocolMessage,
    ) -> Result<Option<ProtocolMessage>> {
        let node_id = conn.remote_node_id();
        let bytes = message.encode()?;
        let send_err = |source| ChatError::Send { node_id, source };

        let (mut send, mut recv) = conn.open_bi().await.map_err(send_err)?;
        send.write_all(&bytes).await.map_err(send_err)?;
        send.finish().await.map_err(send_err)?;

        let reply = match recv.read_to_end(self.inner.config.max_message_size).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!("no reply from {}: {err}", node_id.fmt_short());
                return Ok(None);
            }
        };
        if reply.is_empty() {
            return Ok(None);
        }
        match ProtocolMessage::decode(&reply) {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => {
                debug!("dropping reply from {}: {err}", node_id.fmt_short());
                Ok(None)
            }
        }
    }

    /// Start the accept loop. Only the first call has an effect.
    pub(super) fn start_accept_loop(&self) {
        let mut slot = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(AbortOnDropHandle::new(task::spawn(this.accept_loop())));
    }

    async fn accept_loop(self) {
        debug!("accept loop started");
        loop {
            let incoming = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                incoming = self.inner.transport.accept() => incoming,
            };
            match incoming {
                Ok(Some(conn)) => {
                    let remote = conn.remote_node_id();
                    if self.register(&conn) {
                        info!("accepted connection from {}", remote.fmt_short());
                    } else {
                        debug!("second connection from {}", remote.fmt_short());
                    }
                    self.spawn_receive_loop(conn);
                }
                Ok(None) => {
                    debug!("endpoint stopped accepting connections");
                    break;
                }
                Err(err) => {
                    if !self.is_closed() {
                        let err = ChatError::from(err);
                        error!("accept loop failed: {err}");
                        self.publish(PeerEvent::error(&err));
                    }
                    break;
                }
            }
        }
        debug!("accept loop stopped");
    }

    fn spawn_receive_loop(&self, conn: T::Connection) {
        // Detached: the loop ends with its connection or on shutdown.
        task::spawn(self.clone().receive_loop(conn));
    }

    /// Serially answer request streams on one connection.
    async fn receive_loop(self, conn: T::Connection) {
        let remote = conn.remote_node_id();
        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = conn.accept_bi() => accepted,
            };
            let (mut send, mut recv) = match accepted {
                Ok(streams) => streams,
                Err(err) => {
                    debug!("connection to {} ended: {err}", remote.fmt_short());
                    break;
                }
            };
            if let Err(err) = self.serve(remote, &mut send, &mut recv).await {
                debug!("stream from {} failed: {err}", remote.fmt_short());
                break;
            }
            if !self.is_connected(&remote) {
                break;
            }
        }

        if self.is_closed() {
            return;
        }
        // A second leg to a peer that is tracked through another connection
        // must not take the peer down with it.
        if self.is_tracked_elsewhere(&conn) {
            debug!("dropping second connection to {}", remote.fmt_short());
            return;
        }
        self.handle_disconnect(&remote);
    }

    async fn serve(
        &self,
        remote: NodeId,
        send: &mut <T::Connection as Connection>::Send,
        recv: &mut <T::Connection as Connection>::Recv,
    ) -> std::result::Result<(), TransportError> {
        let request = recv.read_to_end(self.inner.config.max_message_size).await?;
        match ProtocolMessage::decode(&request) {
            Ok(message) => {
                if let Some(reply) = self.handle_message(remote, message) {
                    match reply.encode() {
                        Ok(bytes) => send.write_all(&bytes).await?,
                        Err(err) => warn!("failed to encode reply: {err}"),
                    }
                }
            }
            Err(err) => debug!("dropping payload from {}: {err}", remote.fmt_short()),
        }
        send.finish().await
    }

    /// Reserve an outbound dial. False if one is already running or the peer
    /// is connected.
    fn begin_connect(&self, node_id: NodeId) -> bool {
        let mut state = self.state();
        if state.connections.contains_key(&node_id) {
            return false;
        }
        state.pending.insert(node_id)
    }

    /// Track `conn` as the connection to its peer unless one is tracked
    /// already. Returns whether it is now tracked.
    fn register(&self, conn: &T::Connection) -> bool {
        let remote = conn.remote_node_id();
        let mut state = self.state();
        if state.connections.contains_key(&remote) {
            return false;
        }
        state.connections.insert(remote, conn.clone());
        state.peers.set_connected(&remote, true);
        true
    }

    fn unregister(&self, conn: &T::Connection) {
        let remote = conn.remote_node_id();
        let mut state = self.state();
        if state
            .connections
            .get(&remote)
            .is_some_and(|tracked| tracked.id() == conn.id())
        {
            state.connections.remove(&remote);
            state.peers.set_connected(&remote, false);
        }
    }

    fn is_tracked_elsewhere(&self, conn: &T::Connection) -> bool {
        self.state()
            .connections
            .get(&conn.remote_node_id())
            .is_some_and(|tracked| tracked.id() != conn.id())
    }

    /// The single path by which a peer leaves: drop its connection and, if it
    /// was known, forget it and publish `peer-left` once.
    pub(super) fn handle_disconnect(&self, node_id: &NodeId) {
        let known = {
            let mut state = self.state();
            state.connections.remove(node_id);
            state.peers.remove(node_id).is_some()
        };
        if known {
            info!("peer left: {}", node_id.fmt_short());
            self.publish(PeerEvent::PeerLeft { node_id: *node_id });
        }
    }
}
