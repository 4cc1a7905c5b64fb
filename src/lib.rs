//! Serverless group chat: every member of a room keeps a direct iroh
//! connection to every other member.

pub mod cli;
pub mod error;
pub mod mesh;
mod utils;

pub use error::{ChatError, Result};
pub use mesh::{
    parse_room_id, room_id, ChatMessage, MeshConfig, PeerEvent, PeerInfo, PeerManager,
    ProtocolMessage,
};
