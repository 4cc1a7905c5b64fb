//! Transport abstraction for the chat mesh.
//!
//! Decouples the manager from iroh types: production uses [`IrohTransport`],
//! tests run whole meshes in-process over [`MemoryTransport`].

mod endpoint;
pub mod memory;

use std::future::Future;

pub use endpoint::IrohTransport;
pub use memory::{MemoryNetwork, MemoryTransport};

use crate::error::TransportError;
use iroh::NodeId;

/// A local endpoint: identity, outbound connects and inbound accepts.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// This node's identity.
    fn node_id(&self) -> NodeId;

    /// Resolves once the endpoint is reachable by other nodes.
    fn online(&self) -> impl Future<Output = ()> + Send;

    /// Open a connection to a remote node.
    fn connect(
        &self,
        node_id: NodeId,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Wait for the next inbound connection. `Ok(None)` means the endpoint
    /// will not produce any more connections.
    fn accept(
        &self,
    ) -> impl Future<Output = Result<Option<Self::Connection>, TransportError>> + Send;

    /// Close the endpoint and every connection on it.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A live session with one remote node. Handles are cheap to clone and all
/// refer to the same session.
pub trait Connection: Clone + Send + Sync + 'static {
    type Send: SendStream;
    type Recv: RecvStream;

    fn remote_node_id(&self) -> NodeId;

    /// Identity of this session, distinct from any other session to the same
    /// remote node.
    fn id(&self) -> usize;

    fn open_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), TransportError>> + Send;

    fn accept_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), TransportError>> + Send;

    fn close(&self, code: u32, reason: &[u8]);
}

pub trait SendStream: Send + 'static {
    fn write_all(&mut self, bytes: &[u8])
        -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Signal that no more data will be written.
    fn finish(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub trait RecvStream: Send + 'static {
    /// Read until the sender finishes. Fails if more than `max_bytes` arrive.
    fn read_to_end(
        &mut self,
        max_bytes: usize,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
