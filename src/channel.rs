//! Session event channel: fan-out to every member of an audit session.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! member gets an independent receiver buffering up to `capacity` frames;
//! a lagging member drops its own backlog without affecting the others,
//! which is what keeps one slow subscriber from breaking the rest.
//!
//! Frames published through [`SessionGroup::publish`] are stamped with the
//! room's next sequence number before encoding, so every subscriber
//! observes the same total order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SessionMessage, UserInfo};

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub active_members: usize,
    pub last_seq: u64,
}

/// A fan-out group for a single audit session.
pub struct SessionGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected members of this session
    members: Arc<RwLock<HashMap<Uuid, UserInfo>>>,
    capacity: usize,
    /// Next sequence number for this room. Stamping and sending happen
    /// under this lock so seq order matches delivery order even with
    /// concurrent publishers.
    seq: Mutex<u64>,
    /// Lock-free send counter
    frames_sent: AtomicU64,
}

impl SessionGroup {
    /// Create a new group with the given per-member buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            seq: Mutex::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Add a member; returns their receiver.
    pub async fn add_member(&self, info: UserInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut members = self.members.write().await;
        members.insert(info.user_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, user_id: &Uuid) -> Option<UserInfo> {
        let mut members = self.members.write().await;
        members.remove(user_id)
    }

    /// Stamp the message with the next room sequence number and fan it out.
    ///
    /// Returns the stamped sequence number and the number of receivers.
    /// The send happens under the sequence lock, so two racing publishers
    /// cannot deliver their frames with seq numbers out of order.
    pub fn publish(&self, mut msg: SessionMessage) -> Result<(u64, usize), ProtocolError> {
        let mut seq = self.seq.lock().unwrap_or_else(|e| e.into_inner());
        *seq += 1;
        msg.seq = *seq;
        let encoded = msg.encode()?;
        let count = self.sender.send(Arc::new(encoded)).unwrap_or(0);
        let stamped = *seq;
        drop(seq);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok((stamped, count))
    }

    /// Fan out pre-encoded bytes without stamping (zero-copy fast path).
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<UserInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, user_id: &Uuid) -> bool {
        self.members.read().await.contains_key(user_id)
    }

    pub async fn stats(&self) -> ChannelStats {
        let members = self.members.read().await;
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_members: members.len(),
            last_seq: *self.seq.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering as a member (monitoring).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps audit ids to session groups.
///
/// Each audit gets its own group so frames are isolated between sessions.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<SessionGroup>>>>,
    default_capacity: usize,
}

impl SessionManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for an audit.
    pub async fn get_or_create(&self, audit_id: Uuid) -> Arc<SessionGroup> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(group) = sessions.get(&audit_id) {
                return group.clone();
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = sessions.get(&audit_id) {
            return group.clone();
        }

        let group = Arc::new(SessionGroup::new(self.default_capacity));
        sessions.insert(audit_id, group.clone());
        group
    }

    /// Remove a session with no members left.
    pub async fn remove_if_empty(&self, audit_id: &Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(group) = sessions.get(audit_id) {
            if group.member_count().await == 0 {
                sessions.remove(audit_id);
                return true;
            }
        }
        false
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_audits(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
