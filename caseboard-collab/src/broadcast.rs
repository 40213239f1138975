//! Fan-out of opaque frames to every other connection in a room.
//!
//! One tokio broadcast channel per room: O(1) send, independent
//! per-receiver buffers, lagging receivers drop messages instead of
//! stalling the room. Frames are tagged with the sending connection id
//! so receivers can skip their own traffic without the relay reading
//! payloads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// A frame as it travels through a room: (sender connection id, bytes).
pub type RoomFrame = (u64, Arc<Vec<u8>>);

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_connections: usize,
}

/// Lock-free counters; the hot path never takes a lock.
struct AtomicStats {
    frames_sent: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    connections: Arc<RwLock<HashSet<u64>>>,
    capacity: usize,
    stats: Arc<AtomicStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames can be buffered per receiver
    /// before a lagging receiver starts dropping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: Arc::new(RwLock::new(HashSet::new())),
            capacity,
            stats: Arc::new(AtomicStats {
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Register a connection; returns its receiver.
    pub async fn add_connection(&self, conn_id: u64) -> broadcast::Receiver<RoomFrame> {
        self.connections.write().await.insert(conn_id);
        self.sender.subscribe()
    }

    /// Remove a connection. Returns whether it was registered.
    pub async fn remove_connection(&self, conn_id: u64) -> bool {
        self.connections.write().await.remove(&conn_id)
    }

    /// Fan pre-encoded bytes out to every receiver.
    ///
    /// Returns the number of receivers. The sender's own receiver gets
    /// the frame too; receivers filter by connection id.
    pub fn broadcast(&self, from_conn: u64, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send((from_conn, frame)).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_connections() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_connection(1).await;
        let _rx2 = group.add_connection(2).await;
        assert_eq!(group.connection_count().await, 2);

        assert!(group.remove_connection(1).await);
        assert!(!group.remove_connection(1).await);
        assert_eq!(group.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_connection(1).await;
        let mut rx2 = group.add_connection(2).await;

        let frame = Arc::new(vec![1u8, 2, 3]);
        let count = group.broadcast(1, frame.clone());
        assert_eq!(count, 2);

        let (from, bytes) = rx1.recv().await.unwrap();
        assert_eq!(from, 1);
        assert_eq!(*bytes, vec![1u8, 2, 3]);
        let (from, _) = rx2.recv().await.unwrap();
        assert_eq!(from, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_connection(7).await;
        group.broadcast(7, Arc::new(vec![0u8]));
        group.broadcast(7, Arc::new(vec![1u8]));

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_capacity() {
        let group = BroadcastGroup::new(64);
        assert_eq!(group.capacity(), 64);
    }
}
