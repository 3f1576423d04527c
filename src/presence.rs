//! Presence roster for "who's in this audit session".
//!
//! Each client broadcasts throttled presence updates (status, current view,
//! last activity); the roster merges them per-field, last write wins. A
//! `Roster` frame replaces the whole set: the server sends one on join so a
//! late joiner starts from the authoritative view.
//!
//! Two timestamps drive status: `last_activity_ms` (real user input,
//! carried on the wire) marks a user away after five idle minutes, while
//! the roster-local last-seen instant (any frame from that user, heartbeats
//! included) marks them offline after one missed heartbeat and evicts the
//! entry after three.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::epoch_millis;

/// Heartbeat cadence clients are expected to follow.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Idle window after which a user is shown as away.
pub const AWAY_AFTER_MS: u64 = 5 * 60_000;

/// Missed heartbeats before an entry is evicted from the roster.
pub const EVICT_AFTER_MISSED_HEARTBEATS: u64 = 3;

/// A user's availability within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// One user's presence within a session, keyed by `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub user_name: String,
    pub status: PresenceStatus,
    /// Label of the view the user is on ("dashboard", "findings", ...).
    pub current_view: Option<String>,
    /// Last real user input, epoch millis.
    pub last_activity_ms: u64,
}

impl UserPresence {
    pub fn online(user_id: Uuid, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            status: PresenceStatus::Online,
            current_view: None,
            last_activity_ms: epoch_millis(),
        }
    }
}

struct RosterEntry {
    presence: UserPresence,
    /// When we last heard anything from this user (epoch millis).
    last_seen_ms: u64,
}

/// Tracks the active-user set for one session.
pub struct PresenceRoster {
    local_user_id: Uuid,
    users: HashMap<Uuid, RosterEntry>,
    /// Rate limiter: last time we broadcast a local activity update.
    last_broadcast: Option<Instant>,
    /// Minimum interval between local activity broadcasts.
    broadcast_interval: Duration,
    local_view: Option<String>,
}

impl PresenceRoster {
    pub fn new(local_user_id: Uuid) -> Self {
        Self {
            local_user_id,
            users: HashMap::new(),
            // None: the first broadcast is never throttled
            last_broadcast: None,
            broadcast_interval: Duration::from_secs(1),
            local_view: None,
        }
    }

    /// Create with custom broadcast interval (for testing).
    pub fn with_interval(local_user_id: Uuid, interval: Duration) -> Self {
        let mut roster = Self::new(local_user_id);
        roster.broadcast_interval = interval;
        roster
    }

    /// Merge a single-user presence update heard at `now_ms`.
    ///
    /// Known user: per-field last-write-wins (a missing `current_view`
    /// keeps the previous one). Unknown user: appended.
    pub fn handle_update_at(&mut self, update: UserPresence, now_ms: u64) {
        match self.users.get_mut(&update.user_id) {
            Some(entry) => {
                entry.presence.user_name = update.user_name;
                entry.presence.status = update.status;
                entry.presence.last_activity_ms = update.last_activity_ms;
                if update.current_view.is_some() {
                    entry.presence.current_view = update.current_view;
                }
                entry.last_seen_ms = now_ms;
            }
            None => {
                self.users.insert(
                    update.user_id,
                    RosterEntry { presence: update, last_seen_ms: now_ms },
                );
            }
        }
    }

    pub fn handle_update(&mut self, update: UserPresence) {
        self.handle_update_at(update, epoch_millis());
    }

    /// Replace the full active-user set from a roster frame.
    pub fn replace_all(&mut self, users: Vec<UserPresence>) {
        let now = epoch_millis();
        self.users = users
            .into_iter()
            .map(|u| (u.user_id, RosterEntry { presence: u, last_seen_ms: now }))
            .collect();
    }

    /// Remove a user on clean leave.
    pub fn remove(&mut self, user_id: &Uuid) -> Option<UserPresence> {
        self.users.remove(user_id).map(|e| e.presence)
    }

    /// Build a local activity update if the throttle window has passed.
    ///
    /// Returns `None` when throttled; view changes always produce an update.
    pub fn update_local_activity(
        &mut self,
        user_name: &str,
        view: Option<String>,
    ) -> Option<UserPresence> {
        let view_changed = view != self.local_view;
        if !view_changed {
            if let Some(at) = self.last_broadcast {
                if at.elapsed() < self.broadcast_interval {
                    return None;
                }
            }
        }

        self.last_broadcast = Some(Instant::now());
        self.local_view = view.clone();

        Some(UserPresence {
            user_id: self.local_user_id,
            user_name: user_name.to_string(),
            status: PresenceStatus::Online,
            current_view: view,
            last_activity_ms: epoch_millis(),
        })
    }

    /// Derive away/offline status at `now_ms`.
    ///
    /// A user is offline after one missed heartbeat (2× the interval with
    /// nothing heard), away after [`AWAY_AFTER_MS`] without real activity.
    pub fn mark_idle_at(&mut self, now_ms: u64) {
        for entry in self.users.values_mut() {
            let unheard = now_ms.saturating_sub(entry.last_seen_ms);
            let idle = now_ms.saturating_sub(entry.presence.last_activity_ms);
            if unheard >= 2 * HEARTBEAT_INTERVAL_MS {
                entry.presence.status = PresenceStatus::Offline;
            } else if idle >= AWAY_AFTER_MS {
                entry.presence.status = PresenceStatus::Away;
            }
        }
    }

    /// Evict entries unheard past the eviction window, returning their ids.
    pub fn evict_stale_at(&mut self, now_ms: u64) -> Vec<Uuid> {
        let cutoff = EVICT_AFTER_MISSED_HEARTBEATS * HEARTBEAT_INTERVAL_MS;
        let stale: Vec<Uuid> = self
            .users
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.last_seen_ms) >= cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.users.remove(id);
        }
        stale
    }

    /// All tracked users (for rendering a roster).
    pub fn active_users(&self) -> Vec<UserPresence> {
        self.users.values().map(|e| e.presence.clone()).collect()
    }

    pub fn user(&self, user_id: &Uuid) -> Option<&UserPresence> {
        self.users.get(user_id).map(|e| &e.presence)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }
}
