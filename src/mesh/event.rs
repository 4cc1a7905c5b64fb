use iroh::NodeId;
use serde::{Deserialize, Serialize};

use super::{
    message::{ChatMessage, ProtocolMessage},
    peers::PeerInfo,
};

/// Events delivered to every subscriber of a [`PeerManager`](super::PeerManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerEvent {
    /// The local node is up and part of a room.
    Connected,
    /// A chat line or a rename arrived.
    Message { message: ProtocolMessage },
    PeerJoined { peer: PeerInfo },
    #[serde(rename_all = "camelCase")]
    PeerLeft { node_id: NodeId },
    /// A peer answered with its view of the room. `peers` is our whole known
    /// peer set after applying it; `messages` is the remote batch as received.
    SyncData {
        messages: Vec<ChatMessage>,
        peers: Vec<PeerInfo>,
    },
    Error { message: String },
}

impl PeerEvent {
    pub(crate) fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}
