//! Error types for the chat mesh.

use iroh::NodeId;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::mesh::transport::Transport) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("accept failed: {0}")]
    Accept(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("message too large: more than {max} bytes")]
    TooLarge { max: usize },
}

/// Reasons a room identifier is rejected before any network call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("Room ID is required")]
    Empty,
    #[error("Invalid Room ID: expected {expected} characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("Invalid Room ID: must be a valid hex string")]
    NotHex,
    #[error("Invalid Room ID: not a valid node identifier")]
    InvalidKey,
}

/// Main error type for the peer mesh.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Transport connect/accept failure.
    #[error("{0}")]
    Connection(#[from] TransportError),

    /// The initial join attempt did not complete in time.
    #[error("Connection timed out. The room may not exist or is unreachable.")]
    Timeout,

    /// Malformed wire payload.
    #[error("failed to decode message: {0}")]
    Decode(#[source] postcard::Error),

    /// Failed to serialize an outgoing message.
    #[error("failed to encode message: {0}")]
    Encode(#[source] postcard::Error),

    /// Malformed room id input.
    #[error(transparent)]
    Validation(#[from] RoomIdError),

    /// Failure while delivering a request to a peer.
    #[error("failed to send to {node_id}: {source}")]
    Send {
        node_id: NodeId,
        #[source]
        source: TransportError,
    },

    #[error("Not connected to peer: {0}")]
    NotConnected(NodeId),

    #[error("peer manager is closed")]
    Closed,
}

/// Result type alias using [`ChatError`].
pub type Result<T> = std::result::Result<T, ChatError>;
