use iroh::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ChatError, Result},
    utils::get_timestamp,
};

/// A single chat line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Globally unique id, used to deduplicate during history reconciliation.
    pub id: String,
    /// NodeId of the peer who sent the message
    pub sender: NodeId,
    /// Nickname of the sender at the time of sending
    pub nickname: String,
    /// Message payload
    pub text: String,
    /// milliseconds since EPOCH
    pub timestamp: u64,
}

impl ChatMessage {
    /// Stamp a new message with a fresh id and the current time.
    pub fn new(sender: NodeId, nickname: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            nickname: nickname.into(),
            text: text.into(),
            timestamp: get_timestamp(),
        }
    }
}

/// Membership entry as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub nickname: String,
}

/// Everything two nodes can say to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolMessage {
    #[serde(rename_all = "camelCase")]
    Join { node_id: NodeId, nickname: String },
    #[serde(rename_all = "camelCase")]
    Leave { node_id: NodeId },
    Chat(ChatMessage),
    PeerList { peers: Vec<PeerEntry> },
    SyncData {
        peers: Vec<PeerEntry>,
        messages: Vec<ChatMessage>,
    },
    SyncRequest,
    #[serde(rename_all = "camelCase")]
    Nickname { node_id: NodeId, nickname: String },
}

impl ProtocolMessage {
    pub fn join(node_id: NodeId, nickname: impl Into<String>) -> Self {
        Self::Join {
            node_id,
            nickname: nickname.into(),
        }
    }

    pub fn leave(node_id: NodeId) -> Self {
        Self::Leave { node_id }
    }

    pub fn chat(sender: NodeId, nickname: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Chat(ChatMessage::new(sender, nickname, text))
    }

    pub fn peer_list(peers: Vec<PeerEntry>) -> Self {
        Self::PeerList { peers }
    }

    pub fn sync_data(peers: Vec<PeerEntry>, messages: Vec<ChatMessage>) -> Self {
        Self::SyncData { peers, messages }
    }

    pub fn sync_request() -> Self {
        Self::SyncRequest
    }

    pub fn nickname(node_id: NodeId, nickname: impl Into<String>) -> Self {
        Self::Nickname {
            node_id,
            nickname: nickname.into(),
        }
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Chat(_) => "chat",
            Self::PeerList { .. } => "peer-list",
            Self::SyncData { .. } => "sync-data",
            Self::SyncRequest => "sync-request",
            Self::Nickname { .. } => "nickname",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_stdvec(self).map_err(ChatError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(ChatError::Decode)
    }
}
