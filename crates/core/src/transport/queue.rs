//! Outbound message queue
//!
//! Frames stay queued until the session confirms the write. Entries carry
//! their own [`MessageId`] so identical payloads never remove each other.

use std::collections::VecDeque;
use std::fmt;

/// Identity of one queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A frame waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub frame: String,
}

/// FIFO of not-yet-acknowledged frames
#[derive(Debug, Default)]
pub struct OutboundQueue {
    next_id: u64,
    entries: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and return its identity
    pub fn enqueue(&mut self, frame: String) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.entries.push_back(QueuedMessage { id, frame });
        id
    }

    pub fn get(&self, id: MessageId) -> Option<&QueuedMessage> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Remove exactly the entry with this identity
    ///
    /// Returns false when it is already gone (e.g. drained by close).
    pub fn acknowledge(&mut self, id: MessageId) -> bool {
        match self.entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Entries oldest first
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    /// Drop everything without delivery; returns how many were dropped
    pub fn drain(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_preserves_order() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("a".into());
        queue.enqueue("b".into());
        queue.enqueue("c".into());
        let frames: Vec<&str> = queue.iter().map(|m| m.frame.as_str()).collect();
        assert_eq!(frames, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_payloads_are_removed_by_identity() {
        let mut queue = OutboundQueue::new();
        let first = queue.enqueue("{\"a\":1}".into());
        let second = queue.enqueue("{\"a\":1}".into());
        assert_ne!(first, second);

        assert!(queue.acknowledge(second));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().map(|m| m.id), Some(first));

        // Acknowledging twice is harmless
        assert!(!queue.acknowledge(second));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_acknowledge_out_of_order() {
        let mut queue = OutboundQueue::new();
        let a = queue.enqueue("a".into());
        let b = queue.enqueue("b".into());
        let c = queue.enqueue("c".into());
        queue.acknowledge(b);
        assert!(queue.get(b).is_none());
        let ids: Vec<MessageId> = queue.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("a".into());
        queue.enqueue("b".into());
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
        // Identities keep increasing after a drain
        let next = queue.enqueue("c".into());
        assert_eq!(next.to_string(), "#2");
    }
}
