//! Full-mesh group chat over direct peer connections.
//!
//! A [`PeerManager`] owns one transport endpoint and tries to hold a direct
//! connection to every other member of its room. Membership spreads by
//! forwarding peer lists between connected nodes, and history is reconciled
//! with a `SyncData` reply whenever a node joins or asks for it.

pub mod bus;
pub mod config;
mod connection;
pub mod event;
mod handler;
pub mod history;
pub mod message;
pub mod peers;
pub mod room;
pub mod transport;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

pub use bus::{EventBus, EventSubscription};
pub use config::MeshConfig;
pub use event::PeerEvent;
pub use iroh::NodeId;
pub use message::{ChatMessage, PeerEntry, ProtocolMessage};
pub use peers::PeerInfo;
pub use room::{parse_room_id, room_id};
pub use transport::{Connection, IrohTransport, MemoryNetwork, MemoryTransport, Transport};

use n0_future::{boxed::BoxFuture, task::AbortOnDropHandle};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use history::MessageHistory;
use peers::PeerMap;

/// Handle to a mesh node. Cheap to clone; all clones drive the same node.
///
/// Call [`PeerManager::close`] when done: background loops keep the node
/// alive until then.
pub struct PeerManager<T: Transport = IrohTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for PeerManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    node_id: NodeId,
    transport: T,
    config: MeshConfig,
    state: Mutex<MeshState<T::Connection>>,
    events: EventBus<PeerEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    accept_task: Mutex<Option<AbortOnDropHandle<()>>>,
}

/// Everything the loops share. The lock is never held across an await, so a
/// handler's mutations are atomic with respect to every other task.
struct MeshState<C> {
    nickname: String,
    connections: HashMap<NodeId, C>,
    /// Outbound dials in flight.
    pending: HashSet<NodeId>,
    peers: PeerMap,
    history: MessageHistory,
}

impl<T: Transport> PeerManager<T> {
    pub fn new(nickname: impl Into<String>, transport: T) -> Self {
        Self::with_config(nickname, transport, MeshConfig::default())
    }

    pub fn with_config(nickname: impl Into<String>, transport: T, config: MeshConfig) -> Self {
        let state = MeshState {
            nickname: nickname.into(),
            connections: HashMap::new(),
            pending: HashSet::new(),
            peers: PeerMap::default(),
            history: MessageHistory::with_capacity(config.history_capacity),
        };
        Self {
            inner: Arc::new(Inner {
                node_id: transport.node_id(),
                transport,
                config,
                state: Mutex::new(state),
                events: EventBus::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                accept_task: Mutex::new(None),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn nickname(&self) -> String {
        self.state().nickname.clone()
    }

    /// Snapshot of the known peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state().peers.to_vec()
    }

    /// Snapshot of the message history, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.state().history.to_vec()
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.state().connections.contains_key(node_id)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Attach a new event consumer. Only events published from now on are
    /// delivered to it.
    pub fn subscribe(&self) -> EventSubscription<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Open a new room. The returned node id is the room id others join with.
    pub async fn create(&self) -> Result<NodeId> {
        self.ensure_open()?;
        self.inner.transport.online().await;
        self.start_accept_loop();
        info!("room created: {}", room_id(&self.node_id()));
        self.publish(PeerEvent::Connected);
        Ok(self.node_id())
    }

    /// Join the room hosted by `room`.
    ///
    /// Gives up after the configured connect timeout. On any failure the
    /// manager is closed before the error is returned.
    pub async fn join(&self, room: NodeId) -> Result<()> {
        self.ensure_open()?;
        self.inner.transport.online().await;
        self.start_accept_loop();

        info!("joining room {}", room.fmt_short());
        let attempt =
            tokio::time::timeout(self.inner.config.connect_timeout, self.connect_to_peer(room, true))
                .await;
        let err = match attempt {
            Ok(Ok(())) => {
                info!("joined room {}", room.fmt_short());
                self.publish(PeerEvent::Connected);
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => ChatError::Timeout,
        };
        warn!("failed to join room: {err}");
        self.close().await;
        Err(err)
    }

    /// Send a chat line to every connected peer.
    ///
    /// The message is not added to our own history: the caller does that with
    /// [`PeerManager::add_to_history`].
    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<ChatMessage> {
        self.ensure_open()?;
        let message = ChatMessage::new(self.node_id(), self.nickname(), text);
        self.broadcast(ProtocolMessage::Chat(message.clone())).await;
        Ok(message)
    }

    /// Deliver `message` to every connected peer concurrently.
    ///
    /// Individual failures are published as error events and do not stop
    /// delivery to the other peers.
    pub async fn broadcast(&self, message: ProtocolMessage) {
        let targets: Vec<_> = self
            .state()
            .connections
            .iter()
            .map(|(node_id, conn)| (*node_id, conn.clone()))
            .collect();
        self.send_all(targets, message).await;
    }

    /// Send one request to `node_id` and process its reply, if any.
    pub fn send_to(&self, node_id: NodeId, message: ProtocolMessage) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            let conn = this
                .connection(&node_id)
                .ok_or(ChatError::NotConnected(node_id))?;
            this.deliver(node_id, conn, message).await
        })
    }

    /// Ask a peer for its membership and history. Without a target any
    /// connected peer is asked; with nobody connected this does nothing.
    ///
    /// A failed request is published as an error event, not returned.
    pub async fn request_sync(&self, target: Option<NodeId>) -> Result<()> {
        let target = match target {
            Some(node_id) => Some(node_id),
            None => self.connected_peers().into_iter().next(),
        };
        let Some(target) = target.filter(|node_id| self.is_connected(node_id)) else {
            debug!("no connected peer to sync with");
            return Ok(());
        };
        if let Err(err) = self.send_to(target, ProtocolMessage::sync_request()).await {
            warn!("sync with {} failed: {err}", target.fmt_short());
        }
        Ok(())
    }

    /// Change our nickname and tell every connected peer.
    pub async fn set_nickname(&self, nickname: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        let nickname = nickname.into();
        self.state().nickname = nickname.clone();
        info!("nickname changed to {nickname}");
        self.broadcast(ProtocolMessage::nickname(self.node_id(), nickname))
            .await;
        Ok(())
    }

    /// Append a message to the history. Returns false for a duplicate id.
    pub fn add_to_history(&self, message: ChatMessage) -> bool {
        self.state().history.push(message)
    }

    /// Merge a batch into the history and return the messages that were new.
    pub fn merge_history(&self, batch: impl IntoIterator<Item = ChatMessage>) -> Vec<ChatMessage> {
        self.state().history.merge(batch)
    }

    /// Leave the room and shut the endpoint down. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing peer manager");
        self.inner.events.close_all();

        // Loops keep serving until our Leave is out: a peer closing at the
        // same time is waiting on our answers.
        self.broadcast(ProtocolMessage::leave(self.node_id())).await;
        self.inner.shutdown.cancel();

        let connections: Vec<_> = {
            let mut state = self.state();
            state.pending.clear();
            state.peers.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close(0, b"Leaving room");
        }

        let accept_task = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(accept_task);
        self.inner.transport.close().await;
        info!("peer manager closed");
    }

    /// Exchange `message` over `conn` and handle the reply. Failures are
    /// published unless we are shutting down.
    fn deliver(
        &self,
        node_id: NodeId,
        conn: T::Connection,
        message: ProtocolMessage,
    ) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            debug!(kind = message.kind(), "sending to {}", node_id.fmt_short());
            match this.exchange(&conn, &message).await {
                Ok(Some(reply)) => {
                    // Replies never get a reply of their own.
                    this.handle_message(node_id, reply);
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(err) => {
                    if !this.is_closed() {
                        error!("{err}");
                        this.publish(PeerEvent::error(&err));
                    }
                    Err(err)
                }
            }
        })
    }

    /// `targets` is a snapshot: a peer that drops mid-broadcast still gets
    /// its failure reported.
    async fn send_all(&self, targets: Vec<(NodeId, T::Connection)>, message: ProtocolMessage) {
        let mut sends = JoinSet::new();
        for (node_id, conn) in targets {
            sends.spawn(self.deliver(node_id, conn, message.clone()));
        }
        while let Some(res) = sends.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("broadcast: {err}"),
                Err(err) => warn!("broadcast task failed: {err}"),
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::Closed);
        }
        Ok(())
    }

    fn publish(&self, event: PeerEvent) {
        self.inner.events.publish(event);
    }

    fn state(&self) -> MutexGuard<'_, MeshState<T::Connection>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, node_id: &NodeId) -> Option<T::Connection> {
        self.state().connections.get(node_id).cloned()
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.state().connections.keys().copied().collect()
    }
}
