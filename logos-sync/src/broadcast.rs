//! Fan-out of encoded envelopes to every participant of a document.
//!
//! One tokio broadcast channel per document room. Each participant holds an
//! independent receiver buffering up to `capacity` envelopes; a participant
//! that falls further behind sees `RecvError::Lagged` and must resync from
//! the change log.
//!
//! Performance target: 1,000 envelopes to 100 participants < 10ms
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Envelope, ProtocolError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomStats {
    pub envelopes_sent: u64,
    /// Sends that reached no receiver
    pub envelopes_unheard: u64,
    pub participants: usize,
}

/// A broadcast room for a single document.
pub struct Room {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    participants: RwLock<HashSet<String>>,
    capacity: usize,
    sent: AtomicU64,
    unheard: AtomicU64,
}

impl Room {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            participants: RwLock::new(HashSet::new()),
            capacity,
            sent: AtomicU64::new(0),
            unheard: AtomicU64::new(0),
        }
    }

    /// Register a participant and hand back its receiver.
    pub async fn join(&self, user_id: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.participants.write().await.insert(user_id.to_string());
        self.sender.subscribe()
    }

    pub async fn leave(&self, user_id: &str) -> bool {
        self.participants.write().await.remove(user_id)
    }

    /// Encode and send. Returns the number of receivers reached.
    pub fn publish(&self, envelope: &Envelope) -> Result<usize, ProtocolError> {
        let encoded = envelope.encode()?;
        Ok(self.publish_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes without touching any lock.
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(encoded) {
            Ok(count) => count,
            Err(_) => {
                self.unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Receiver without registering a participant (observers, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn has_participant(&self, user_id: &str) -> bool {
        self.participants.read().await.contains(user_id)
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            envelopes_sent: self.sent.load(Ordering::Relaxed),
            envelopes_unheard: self.unheard.load(Ordering::Relaxed),
            participants: self.participants.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.default_capacity));
        rooms.insert(doc_id, room.clone());
        room
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room nobody participates in.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.participant_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::protocol::ChangeBroadcast;
    use crate::vcs::BranchId;

    fn envelope(doc: Uuid) -> Envelope {
        Envelope::change(
            doc,
            &ChangeBroadcast {
                branch: BranchId::main(),
                version: 1,
                change: Change::insert("alice", 0, "body", 0, "hi"),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_to_participants() {
        let room = Room::new(16);
        let doc = Uuid::new_v4();
        let mut alice = room.join("alice").await;
        let mut bob = room.join("bob").await;

        assert_eq!(room.publish(&envelope(doc)).unwrap(), 2);
        let a = alice.recv().await.unwrap();
        let b = bob.recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(Envelope::decode(&a).unwrap().document_id, doc);
    }

    #[tokio::test]
    async fn test_stats_count_unheard_sends() {
        let room = Room::new(4);
        room.publish_raw(Arc::new(vec![1]));
        let _rx = room.join("alice").await;
        room.publish_raw(Arc::new(vec![2]));
        let stats = room.stats().await;
        assert_eq!(stats.envelopes_sent, 2);
        assert_eq!(stats.envelopes_unheard, 1);
        assert_eq!(stats.participants, 1);
    }

    #[tokio::test]
    async fn test_room_manager_reuses_and_cleans_up() {
        let manager = RoomManager::new(8);
        let doc = Uuid::new_v4();
        let first = manager.get_or_create(doc).await;
        let second = manager.get_or_create(doc).await;
        assert!(Arc::ptr_eq(&first, &second));

        let _rx = first.join("alice").await;
        assert!(!manager.remove_if_empty(&doc).await);
        first.leave("alice").await;
        assert!(manager.remove_if_empty(&doc).await);
        assert_eq!(manager.room_count().await, 0);
    }
}
