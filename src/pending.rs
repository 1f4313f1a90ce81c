//! Pending-signal buffer.
//!
//! Per-peer FIFO of relay messages that could not be delivered when they were
//! sent. Drained in order the next time the peer's session starts. Each queue
//! is bounded; when full the oldest entry is dropped. The number of distinct
//! targets is bounded too, since target ids are client-supplied.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{PeerId, ServerMessage};

#[derive(Debug, Clone)]
struct PendingSignal {
    message: ServerMessage,
    queued_at: Instant,
}

/// Buffered messages keyed by target peer.
#[derive(Debug)]
pub struct PendingSignals {
    queues: HashMap<PeerId, VecDeque<PendingSignal>>,
    max_per_peer: usize,
    max_targets: usize,
    ttl: Duration,
}

impl PendingSignals {
    pub fn new(max_per_peer: usize, max_targets: usize, ttl: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_peer: max_per_peer.max(1),
            max_targets: max_targets.max(1),
            ttl,
        }
    }

    /// Queue a message for `to`. Returns false if the message was dropped
    /// because `to` has no queue yet and the target limit is reached.
    pub fn push(&mut self, to: &str, message: ServerMessage, now: Instant) -> bool {
        if !self.queues.contains_key(to) && self.queues.len() >= self.max_targets {
            tracing::warn!(
                peer = to,
                targets = self.queues.len(),
                "Too many buffered targets, dropping signal"
            );
            return false;
        }

        let queue = self.queues.entry(to.to_string()).or_default();

        if queue.len() >= self.max_per_peer {
            tracing::warn!(
                peer = to,
                queue_size = queue.len(),
                "Pending queue full, dropping oldest signal"
            );
            queue.pop_front();
        }

        queue.push_back(PendingSignal {
            message,
            queued_at: now,
        });
        tracing::debug!(peer = to, queued = queue.len(), "Buffered signal");
        true
    }

    /// Remove and return everything queued for `id`, oldest first.
    /// Entries older than the TTL are dropped.
    pub fn drain(&mut self, id: &str, now: Instant) -> Vec<ServerMessage> {
        let Some(queue) = self.queues.remove(id) else {
            return Vec::new();
        };
        let ttl = self.ttl;
        queue
            .into_iter()
            .filter(|signal| now.saturating_duration_since(signal.queued_at) <= ttl)
            .map(|signal| signal.message)
            .collect()
    }

    /// Throw away a peer's queue. Returns how many entries were dropped.
    pub fn discard(&mut self, id: &str) -> usize {
        self.queues.remove(id).map(|q| q.len()).unwrap_or(0)
    }

    /// Drop expired entries across all peers. Returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut dropped = 0usize;
        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|signal| now.saturating_duration_since(signal.queued_at) <= ttl);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }

    /// Number of entries queued for one peer.
    #[cfg(test)]
    pub fn queued_for(&self, id: &str) -> usize {
        self.queues.get(id).map(VecDeque::len).unwrap_or(0)
    }

    /// Total number of queued entries.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal(n: u32) -> ServerMessage {
        ServerMessage::Signal {
            sender_id: "alice".to_string(),
            payload: json!({ "seq": n }),
        }
    }

    #[test]
    fn test_drain_is_fifo_and_empties_queue() {
        let mut pending = PendingSignals::new(10, 16, Duration::from_secs(60));
        let now = Instant::now();
        for n in 0..3 {
            pending.push("bob", signal(n), now);
        }
        assert_eq!(pending.queued_for("bob"), 3);

        let drained = pending.drain("bob", now);
        assert_eq!(drained, vec![signal(0), signal(1), signal(2)]);
        assert_eq!(pending.queued_for("bob"), 0);
        assert!(pending.drain("bob", now).is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut pending = PendingSignals::new(3, 16, Duration::from_secs(60));
        let now = Instant::now();
        for n in 0..5 {
            pending.push("bob", signal(n), now);
        }

        let drained = pending.drain("bob", now);
        assert_eq!(drained, vec![signal(2), signal(3), signal(4)]);
    }

    #[test]
    fn test_expired_entries_are_not_delivered() {
        let mut pending = PendingSignals::new(10, 16, Duration::from_secs(30));
        let start = Instant::now();
        pending.push("bob", signal(0), start);
        pending.push("bob", signal(1), start + Duration::from_secs(20));

        let drained = pending.drain("bob", start + Duration::from_secs(40));
        assert_eq!(drained, vec![signal(1)]);
    }

    #[test]
    fn test_purge_expired_removes_empty_queues() {
        let mut pending = PendingSignals::new(10, 16, Duration::from_secs(30));
        let start = Instant::now();
        pending.push("bob", signal(0), start);
        pending.push("carol", signal(1), start + Duration::from_secs(25));

        let dropped = pending.purge_expired(start + Duration::from_secs(31));
        assert_eq!(dropped, 1);
        assert_eq!(pending.queued_for("bob"), 0);
        assert_eq!(pending.queued_for("carol"), 1);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_target_limit_refuses_new_targets_only() {
        let mut pending = PendingSignals::new(10, 2, Duration::from_secs(30));
        let now = Instant::now();
        assert!(pending.push("bob", signal(0), now));
        assert!(pending.push("carol", signal(1), now));

        assert!(!pending.push("mallory", signal(2), now));
        assert_eq!(pending.queued_for("mallory"), 0);

        // Existing targets still accept entries.
        assert!(pending.push("bob", signal(3), now));
        assert_eq!(pending.len(), 3);

        pending.drain("carol", now);
        assert!(pending.push("mallory", signal(4), now));
    }

    #[test]
    fn test_discard() {
        let mut pending = PendingSignals::new(10, 16, Duration::from_secs(30));
        let now = Instant::now();
        pending.push("bob", signal(0), now);
        pending.push("bob", signal(1), now);

        assert_eq!(pending.discard("bob"), 2);
        assert_eq!(pending.discard("bob"), 0);
    }
}
