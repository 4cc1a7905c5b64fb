//! Dispatch of incoming protocol messages.

use iroh::NodeId;
use n0_future::task;
use tracing::{debug, info};

use super::{
    event::PeerEvent,
    message::{PeerEntry, ProtocolMessage},
    peers::PeerInfo,
    transport::Transport,
    MeshState, PeerManager,
};

impl<T: Transport> PeerManager<T> {
    /// Apply `message` from `from` to our state and publish the matching
    /// events. Returns the reply to write back, if the kind has one.
    ///
    /// Runs without suspending, so every mutation it makes is atomic with
    /// respect to the other loops. Follow-up network work is spawned.
    pub(super) fn handle_message(
        &self,
        from: NodeId,
        message: ProtocolMessage,
    ) -> Option<ProtocolMessage> {
        debug!(kind = message.kind(), "message from {}", from.fmt_short());
        match message {
            ProtocolMessage::Join { node_id, nickname } => {
                let peer = PeerInfo::new(node_id, nickname, true);
                let (reply, others) = {
                    let mut state = self.state();
                    state.peers.upsert(peer.clone());
                    let others: Vec<_> = state
                        .connections
                        .iter()
                        .filter(|(id, _)| **id != node_id && **id != from)
                        .map(|(id, conn)| (*id, conn.clone()))
                        .collect();
                    (self.sync_data(&state), others)
                };
                info!("peer joined: {} ({})", peer.nickname, node_id.fmt_short());
                self.publish(PeerEvent::PeerJoined { peer: peer.clone() });

                // Tell everyone else about the newcomer so they dial it.
                if !others.is_empty() {
                    let this = self.clone();
                    let gossip = ProtocolMessage::peer_list(vec![peer.entry()]);
                    task::spawn(async move { this.send_all(others, gossip).await });
                }
                Some(reply)
            }
            ProtocolMessage::PeerList { peers } => {
                self.merge_peers(&peers);
                None
            }
            ProtocolMessage::SyncData { peers, messages } => {
                self.merge_peers(&peers);
                let (added, snapshot) = {
                    let mut state = self.state();
                    let added = state.history.merge(messages.iter().cloned());
                    (added.len(), state.peers.to_vec())
                };
                debug!(
                    "sync from {}: {} messages, {added} new",
                    from.fmt_short(),
                    messages.len()
                );
                self.publish(PeerEvent::SyncData {
                    messages,
                    peers: snapshot,
                });
                None
            }
            ProtocolMessage::Leave { node_id } => {
                self.handle_disconnect(&node_id);
                None
            }
            message @ ProtocolMessage::Chat(_) => {
                self.publish(PeerEvent::Message { message });
                None
            }
            ProtocolMessage::Nickname { node_id, nickname } => {
                if self.state().peers.rename(&node_id, &nickname) {
                    debug!("{} is now {nickname}", node_id.fmt_short());
                }
                self.publish(PeerEvent::Message {
                    message: ProtocolMessage::Nickname { node_id, nickname },
                });
                None
            }
            ProtocolMessage::SyncRequest => Some(self.sync_data(&self.state())),
        }
    }

    /// Learn about unseen peers from a gossiped batch, publish them, and dial
    /// the ones we are not connected to yet.
    fn merge_peers(&self, batch: &[PeerEntry]) {
        let added = {
            let mut state = self.state();
            let MeshState {
                peers, connections, ..
            } = &mut *state;
            peers.merge(&self.node_id(), batch, |id| connections.contains_key(id))
        };
        for peer in added {
            info!("learned about {} ({})", peer.nickname, peer.node_id.fmt_short());
            let dial = !peer.connected;
            let node_id = peer.node_id;
            self.publish(PeerEvent::PeerJoined { peer });
            if dial {
                // Failures surface as error events from `connect_to_peer`.
                task::spawn(self.connect_to_peer(node_id, false));
            }
        }
    }

    /// Our full view of the room: every known peer plus ourselves, and the
    /// whole history.
    fn sync_data(&self, state: &MeshState<T::Connection>) -> ProtocolMessage {
        let mut peers = state.peers.entries();
        peers.push(PeerEntry {
            node_id: self.node_id(),
            nickname: state.nickname.clone(),
        });
        ProtocolMessage::sync_data(peers, state.history.to_vec())
    }
}
