use std::collections::HashMap;

use iroh::NodeId;
use serde::{Deserialize, Serialize};

use super::message::PeerEntry;

/// Known members of the room, keyed by node id. Never contains the local node.
#[derive(Debug, Default)]
pub struct PeerMap(HashMap<NodeId, PeerInfo>);

impl PeerMap {
    pub fn get(&self, id: &NodeId) -> Option<&PeerInfo> {
        self.0.get(id)
    }
    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.contains_key(id)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn to_vec(&self) -> Vec<PeerInfo> {
        self.0.values().cloned().collect()
    }
    /// Wire form of the membership, without connection state.
    pub fn entries(&self) -> Vec<PeerEntry> {
        self.0.values().map(PeerInfo::entry).collect()
    }
    /// Insert a peer, or overwrite what we know about it.
    pub fn upsert(&mut self, peer: PeerInfo) {
        self.0.insert(peer.node_id, peer);
    }
    pub fn remove(&mut self, id: &NodeId) -> Option<PeerInfo> {
        self.0.remove(id)
    }
    pub fn clear(&mut self) {
        self.0.clear();
    }
    /// Flip the connection flag of a known peer. Unknown peers are ignored.
    pub fn set_connected(&mut self, id: &NodeId, connected: bool) {
        if let Some(peer) = self.0.get_mut(id) {
            peer.connected = connected;
        }
    }
    /// Apply a rename. Returns false if the peer is unknown.
    pub fn rename(&mut self, id: &NodeId, nickname: &str) -> bool {
        match self.0.get_mut(id) {
            Some(peer) => {
                peer.nickname = nickname.to_string();
                true
            }
            None => false,
        }
    }
    /// Merge a gossiped peer batch.
    ///
    /// Only unseen ids are inserted; a known peer is never overwritten by
    /// gossip. `me` is skipped. Returns the peers that were added, in batch
    /// order.
    pub fn merge(
        &mut self,
        me: &NodeId,
        batch: &[PeerEntry],
        is_connected: impl Fn(&NodeId) -> bool,
    ) -> Vec<PeerInfo> {
        let mut added = Vec::new();
        for entry in batch {
            if entry.node_id == *me || self.0.contains_key(&entry.node_id) {
                continue;
            }
            let peer = PeerInfo::new(
                entry.node_id,
                entry.nickname.clone(),
                is_connected(&entry.node_id),
            );
            self.0.insert(peer.node_id, peer.clone());
            added.push(peer);
        }
        added
    }
}

/// Information for the front end to display about known peers in the room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub nickname: String,
    /// Whether a live connection to this peer currently exists.
    pub connected: bool,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, nickname: impl Into<String>, connected: bool) -> Self {
        Self {
            node_id,
            nickname: nickname.into(),
            connected,
        }
    }
    pub fn entry(&self) -> PeerEntry {
        PeerEntry {
            node_id: self.node_id,
            nickname: self.nickname.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iroh::SecretKey;
    use std::collections::HashSet;

    fn node() -> NodeId {
        SecretKey::generate(rand::rngs::OsRng).public()
    }

    fn entry(node_id: NodeId, nickname: &str) -> PeerEntry {
        PeerEntry {
            node_id,
            nickname: nickname.into(),
        }
    }

    #[test]
    fn merge_skips_self_and_known_peers() {
        let me = node();
        let bob = node();
        let carol = node();
        let mut peers = PeerMap::default();
        peers.upsert(PeerInfo::new(bob, "bob", true));

        let added = peers.merge(
            &me,
            &[entry(me, "me"), entry(bob, "robert"), entry(carol, "carol")],
            |_| false,
        );

        assert_eq!(added, vec![PeerInfo::new(carol, "carol", false)]);
        assert!(!peers.contains(&me));
        // gossip never overwrites a known peer
        assert_eq!(peers.get(&bob).unwrap().nickname, "bob");
        assert!(peers.get(&bob).unwrap().connected);
    }

    #[test]
    fn merge_derives_connected_flag_at_insert() {
        let me = node();
        let bob = node();
        let carol = node();
        let mut peers = PeerMap::default();
        peers.merge(&me, &[entry(bob, "bob"), entry(carol, "carol")], |id| {
            *id == bob
        });
        assert!(peers.get(&bob).unwrap().connected);
        assert!(!peers.get(&carol).unwrap().connected);
    }

    #[test]
    fn repeated_merges_yield_the_union_of_ids() {
        let me = node();
        let ids: Vec<NodeId> = (0..6).map(|_| node()).collect();
        let mut peers = PeerMap::default();
        let batches = [
            vec![entry(ids[0], "a"), entry(ids[1], "b"), entry(me, "me")],
            vec![entry(ids[1], "b2"), entry(ids[2], "c")],
            vec![entry(ids[3], "d"), entry(ids[4], "e"), entry(ids[0], "a2")],
            vec![entry(ids[5], "f"), entry(me, "me")],
        ];
        for batch in &batches {
            peers.merge(&me, batch, |_| false);
        }
        peers.rename(&ids[2], "charlie");

        let known: HashSet<NodeId> = peers.to_vec().iter().map(|p| p.node_id).collect();
        let expected: HashSet<NodeId> = ids.iter().copied().collect();
        assert_eq!(known, expected);
        assert_eq!(peers.get(&ids[0]).unwrap().nickname, "a");
        assert_eq!(peers.get(&ids[1]).unwrap().nickname, "b");
        assert_eq!(peers.get(&ids[2]).unwrap().nickname, "charlie");
    }

    #[test]
    fn rename_and_connection_flag_only_touch_known_peers() {
        let bob = node();
        let stranger = node();
        let mut peers = PeerMap::default();
        peers.upsert(PeerInfo::new(bob, "bob", false));

        assert!(peers.rename(&bob, "bobby"));
        assert!(!peers.rename(&stranger, "who"));
        peers.set_connected(&bob, true);
        peers.set_connected(&stranger, true);

        assert_eq!(peers.get(&bob), Some(&PeerInfo::new(bob, "bobby", true)));
        assert!(!peers.contains(&stranger));
        assert_eq!(peers.entries(), vec![entry(bob, "bobby")]);
    }
}
