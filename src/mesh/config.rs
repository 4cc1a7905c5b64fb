use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::history::MAX_HISTORY_SIZE;

/// ALPN identifier for the chat protocol.
pub const ALPN: &[u8] = b"chatter/1";

/// Largest request or response accepted on a stream (1MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long `join` waits for the first connection before giving up.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for a [`PeerManager`](super::PeerManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    pub alpn: Vec<u8>,
    pub connect_timeout: Duration,
    pub max_message_size: usize,
    pub history_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            alpn: ALPN.to_vec(),
            connect_timeout: CONNECTION_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            history_capacity: MAX_HISTORY_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.alpn, b"chatter/1");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.history_capacity, 100);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: MeshConfig = serde_json::from_str(r#"{"historyCapacity": 5}"#).unwrap();
        assert_eq!(config.history_capacity, 5);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }
}
