//! In-process loopback transport.
//!
//! Endpoints register on a shared [`MemoryNetwork`]; each bi-stream is a
//! `tokio::io::DuplexStream` pair. Dialing an id that is not registered never
//! completes, which is how an unreachable room looks from the outside.
//! Dialing an endpoint that was closed fails straight away.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use iroh::{NodeId, SecretKey};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream, ReadHalf, WriteHalf},
    select,
    sync::{mpsc, Mutex as TokioMutex},
};
use tokio_util::sync::CancellationToken;

use super::{Connection, RecvStream, SendStream, Transport};
use crate::error::TransportError;

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
struct Listener {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
    shutdown: CancellationToken,
}

/// Shared broker routing connections between [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<NodeId, Listener>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint with a fresh identity.
    pub fn endpoint(&self) -> MemoryTransport {
        let node_id = SecretKey::generate(rand::rngs::OsRng).public();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                node_id,
                Listener {
                    accept_tx,
                    shutdown: shutdown.clone(),
                },
            );
        MemoryTransport {
            node_id,
            network: self.clone(),
            accept_rx: Arc::new(TokioMutex::new(accept_rx)),
            shutdown,
        }
    }

    fn lookup(&self, node_id: &NodeId) -> Option<Listener> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
    accept_rx: Arc<TokioMutex<mpsc::UnboundedReceiver<MemoryConnection>>>,
    shutdown: CancellationToken,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn online(&self) {}

    async fn connect(&self, node_id: NodeId) -> Result<MemoryConnection, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Connect("endpoint closed".into()));
        }
        let Some(listener) = self.network.lookup(&node_id) else {
            // Unreachable: the dial only ends when our own endpoint closes.
            self.shutdown.cancelled().await;
            return Err(TransportError::Connect("endpoint closed".into()));
        };
        if listener.shutdown.is_cancelled() {
            return Err(TransportError::Connect(format!(
                "connection refused by {}",
                node_id.fmt_short()
            )));
        }

        let session = CancellationToken::new();
        let (local_tx, remote_rx) = mpsc::unbounded_channel();
        let (remote_tx, local_rx) = mpsc::unbounded_channel();
        let local = MemoryConnection::new(
            node_id,
            local_tx,
            local_rx,
            Liveness {
                session: session.clone(),
                local: self.shutdown.clone(),
                remote: listener.shutdown.clone(),
            },
        );
        let remote = MemoryConnection::new(
            self.node_id,
            remote_tx,
            remote_rx,
            Liveness {
                session,
                local: listener.shutdown.clone(),
                remote: self.shutdown.clone(),
            },
        );
        listener.accept_tx.send(remote).map_err(|_| {
            TransportError::Connect(format!("connection refused by {}", node_id.fmt_short()))
        })?;
        Ok(local)
    }

    async fn accept(&self) -> Result<Option<MemoryConnection>, TransportError> {
        let mut accept_rx = self.accept_rx.lock().await;
        select! {
            _ = self.shutdown.cancelled() => Ok(None),
            conn = accept_rx.recv() => Ok(conn),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

/// A session ends when either side closes it or either endpoint shuts down.
#[derive(Clone)]
struct Liveness {
    session: CancellationToken,
    local: CancellationToken,
    remote: CancellationToken,
}

impl Liveness {
    fn is_closed(&self) -> bool {
        self.session.is_cancelled() || self.local.is_cancelled() || self.remote.is_cancelled()
    }

    async fn closed(&self) {
        select! {
            _ = self.session.cancelled() => {}
            _ = self.local.cancelled() => {}
            _ = self.remote.cancelled() => {}
        }
    }
}

type StreamPair = (MemorySend, MemoryRecv);

struct ConnectionInner {
    id: usize,
    remote: NodeId,
    opened_tx: mpsc::UnboundedSender<StreamPair>,
    incoming_rx: TokioMutex<mpsc::UnboundedReceiver<StreamPair>>,
    liveness: Liveness,
}

#[derive(Clone)]
pub struct MemoryConnection(Arc<ConnectionInner>);

impl MemoryConnection {
    fn new(
        remote: NodeId,
        opened_tx: mpsc::UnboundedSender<StreamPair>,
        incoming_rx: mpsc::UnboundedReceiver<StreamPair>,
        liveness: Liveness,
    ) -> Self {
        Self(Arc::new(ConnectionInner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            opened_tx,
            incoming_rx: TokioMutex::new(incoming_rx),
            liveness,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.0.liveness.is_closed()
    }
}

impl Connection for MemoryConnection {
    type Send = MemorySend;
    type Recv = MemoryRecv;

    fn remote_node_id(&self) -> NodeId {
        self.0.remote
    }

    fn id(&self) -> usize {
        self.0.id
    }

    async fn open_bi(&self) -> Result<StreamPair, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed("connection closed".into()));
        }
        let (mine, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        let (my_read, my_write) = tokio::io::split(mine);
        let (their_read, their_write) = tokio::io::split(theirs);
        let liveness = &self.0.liveness;
        self.0
            .opened_tx
            .send((
                MemorySend(their_write),
                MemoryRecv(their_read, liveness.clone()),
            ))
            .map_err(|_| TransportError::Closed("connection closed".into()))?;
        Ok((MemorySend(my_write), MemoryRecv(my_read, liveness.clone())))
    }

    async fn accept_bi(&self) -> Result<StreamPair, TransportError> {
        let mut incoming = self.0.incoming_rx.lock().await;
        select! {
            _ = self.0.liveness.closed() => Err(TransportError::Closed("connection closed".into())),
            pair = incoming.recv() => {
                pair.ok_or_else(|| TransportError::Closed("connection lost".into()))
            }
        }
    }

    fn close(&self, _code: u32, _reason: &[u8]) {
        self.0.liveness.session.cancel();
    }
}

pub struct MemorySend(WriteHalf<DuplexStream>);

impl SendStream for MemorySend {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.0
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        self.0
            .shutdown()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

pub struct MemoryRecv(ReadHalf<DuplexStream>, Liveness);

impl RecvStream for MemoryRecv {
    async fn read_to_end(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.0).take(max_bytes as u64 + 1);
        let read = limited.read_to_end(&mut buf);
        select! {
            _ = self.1.closed() => Err(TransportError::Closed("connection closed".into())),
            res = read => {
                let len = res.map_err(|e| TransportError::Stream(e.to_string()))?;
                if len > max_bytes {
                    return Err(TransportError::TooLarge { max: max_bytes });
                }
                Ok(buf)
            }
        }
    }
}
