use std::collections::{HashSet, VecDeque};

use super::message::ChatMessage;

/// Default number of messages kept per room.
pub const MAX_HISTORY_SIZE: usize = 100;

/// Bounded chat log. The oldest entry is evicted first on overflow and ids
/// are unique within the log.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    messages: VecDeque<ChatMessage>,
    ids: HashSet<String>,
    capacity: usize,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::with_capacity(MAX_HISTORY_SIZE)
    }
}

impl MessageHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    /// Append in insertion order. A message whose id is already present is
    /// ignored; returns whether it was appended.
    pub fn push(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push_back(message);
        self.evict();
        true
    }

    /// Reconcile with a batch received from another node.
    ///
    /// Unseen ids are added, the log is re-sorted by timestamp and the
    /// capacity is reapplied. Returns the messages that were new to this log,
    /// in timestamp order. Merging the same batch twice is a no-op.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = ChatMessage>) -> Vec<ChatMessage> {
        let mut added = Vec::new();
        for message in batch {
            if self.ids.insert(message.id.clone()) {
                added.push(message.clone());
                self.messages.push_back(message);
            }
        }
        if added.is_empty() {
            return added;
        }
        self.messages
            .make_contiguous()
            .sort_by_key(|message| message.timestamp);
        self.evict();
        added.sort_by_key(|message| message.timestamp);
        added
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    fn evict(&mut self) {
        while self.messages.len() > self.capacity {
            if let Some(oldest) = self.messages.pop_front() {
                self.ids.remove(&oldest.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iroh::{NodeId, SecretKey};

    fn node() -> NodeId {
        SecretKey::generate(rand::rngs::OsRng).public()
    }

    fn message(sender: NodeId, text: &str, timestamp: u64) -> ChatMessage {
        ChatMessage {
            timestamp,
            ..ChatMessage::new(sender, "tester", text)
        }
    }

    #[test]
    fn oldest_message_is_evicted_on_overflow() {
        let me = node();
        let mut history = MessageHistory::default();
        let sent: Vec<ChatMessage> = (0..101)
            .map(|i| message(me, &format!("msg {i}"), i as u64))
            .collect();
        for msg in &sent {
            history.push(msg.clone());
        }

        assert_eq!(history.len(), MAX_HISTORY_SIZE);
        let snapshot = history.to_vec();
        assert!(!snapshot.contains(&sent[0]));
        assert!(!history.contains(&sent[0].id));
        assert_eq!(snapshot.first(), Some(&sent[1]));
        assert_eq!(snapshot.last(), Some(&sent[100]));
    }

    #[test]
    fn push_keeps_insertion_order_and_unique_ids() {
        let me = node();
        let mut history = MessageHistory::default();
        let late = message(me, "late", 20);
        let early = message(me, "early", 10);
        assert!(history.push(late.clone()));
        assert!(history.push(early.clone()));
        assert!(!history.push(late.clone()));
        assert_eq!(history.to_vec(), vec![late, early]);
    }

    #[test]
    fn merge_dedups_and_sorts_by_timestamp() {
        let (a, b) = (node(), node());
        let mut history = MessageHistory::default();
        let first = message(a, "first", 10);
        let third = message(a, "third", 30);
        history.push(third.clone());
        history.push(first.clone());

        let second = message(b, "second", 20);
        let added = history.merge(vec![third.clone(), second.clone()]);

        assert_eq!(added, vec![second.clone()]);
        assert_eq!(history.to_vec(), vec![first, second, third]);
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let (a, b) = (node(), node());
        let mut history = MessageHistory::default();
        history.push(message(a, "local", 15));
        let batch: Vec<ChatMessage> = (0..5).map(|i| message(b, "remote", i * 10)).collect();

        history.merge(batch.clone());
        let once = history.to_vec();
        let added = history.merge(batch);

        assert!(added.is_empty());
        assert_eq!(history.to_vec(), once);
    }

    #[test]
    fn merge_reapplies_capacity() {
        let (a, b) = (node(), node());
        let mut history = MessageHistory::with_capacity(3);
        history.push(message(a, "newest", 100));
        let batch = vec![
            message(b, "old", 1),
            message(b, "older", 0),
            message(b, "mid", 50),
        ];
        history.merge(batch);

        let texts: Vec<String> = history.to_vec().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["old", "mid", "newest"]);
    }
}
