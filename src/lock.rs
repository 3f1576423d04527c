//! Time-boxed edit leases with server-side arbitration.
//!
//! A lease is an advisory claim of exclusive edit rights over one
//! `(resource_id, resource_type)`. The server owns the [`LeaseTable`] and
//! arbitrates every acquire/refresh with a compare-and-swap on the lease's
//! monotonic version token: two clients racing for the same resource get
//! exactly one grant. Clients hold an [`EditorLock`] state machine that only
//! reflects what the server told them:
//!
//! ```text
//! Unlocked → PendingAcquire → Held → (Refreshing) → Released | Expired
//! ```
//!
//! Expired leases are removed by a periodic sweep (10s) and the revocation
//! is broadcast, so peers learn of availability immediately rather than
//! waiting out their own timers.
//!
//! All table operations take `now` in epoch milliseconds so that expiry
//! behavior is testable without wall-clock sleeps; `*_at`-less wrappers
//! stamp the current time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::{epoch_millis, ResourceKey, UserInfo};

/// Default lease duration in minutes.
pub const DEFAULT_LOCK_MINUTES: u64 = 10;

/// Interval between expiry sweeps, in seconds.
pub const LEASE_SWEEP_INTERVAL_SECS: u64 = 10;

/// Request payload: ask for a lease of the given duration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRequest {
    pub duration_ms: u64,
}

impl LockRequest {
    pub fn minutes(minutes: u64) -> Self {
        Self { duration_ms: minutes * 60_000 }
    }
}

impl Default for LockRequest {
    fn default() -> Self {
        Self::minutes(DEFAULT_LOCK_MINUTES)
    }
}

/// Refresh payload: re-stamp a held lease. The version must match the
/// server's current lease or the refresh is rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRefresh {
    pub version: u64,
}

/// Denial payload sent to a requester whose resource is already leased.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockDenied {
    pub held_by: UserInfo,
    pub locked_until_ms: u64,
}

/// Revocation payload broadcast when a lease is cleared without its owner
/// releasing it: either the expiry sweep (`forced: false`) or an explicit
/// force-unlock (`forced: true`, with the forcing user's id).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRevoked {
    pub forced: bool,
    pub by: Option<Uuid>,
    pub version: u64,
}

/// A granted edit lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub resource: ResourceKey,
    pub user_id: Uuid,
    pub user_name: String,
    pub locked_at_ms: u64,
    pub duration_ms: u64,
    /// Monotonic per-resource version token. Bumped on every grant and
    /// refresh; never reset, even across release/reacquire.
    pub version: u64,
}

impl Lease {
    /// Instant at which this lease stops being honored.
    pub fn locked_until_ms(&self) -> u64 {
        self.locked_at_ms.saturating_add(self.duration_ms)
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.locked_until_ms()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(epoch_millis())
    }

    /// Remaining validity at `now_ms` (zero if expired).
    pub fn remaining_ms_at(&self, now_ms: u64) -> u64 {
        self.locked_until_ms().saturating_sub(now_ms)
    }

    fn holder(&self) -> UserInfo {
        UserInfo::with_id(self.user_id, self.user_name.clone())
    }
}

/// Server-side lease table: one valid lease per resource, CAS-arbitrated.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<ResourceKey, Lease>,
    /// Last version handed out per resource. Survives release so a stale
    /// refresh from a previous incarnation can never match.
    versions: HashMap<ResourceKey, u64>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire a lease at `now_ms`.
    ///
    /// Grants if the resource is unleased, its lease has expired, or the
    /// requester already holds it (a self-acquire re-stamps the lease, which
    /// is how an owner extends with a new duration). Otherwise returns the
    /// current holder as a denial.
    pub fn acquire_at(
        &mut self,
        resource: ResourceKey,
        user: &UserInfo,
        duration_ms: u64,
        now_ms: u64,
    ) -> Result<Lease, LockDenied> {
        if let Some(existing) = self.leases.get(&resource) {
            if !existing.is_expired_at(now_ms) && existing.user_id != user.user_id {
                return Err(LockDenied {
                    held_by: existing.holder(),
                    locked_until_ms: existing.locked_until_ms(),
                });
            }
        }

        let version = self.bump_version(resource);
        let lease = Lease {
            resource,
            user_id: user.user_id,
            user_name: user.user_name.clone(),
            locked_at_ms: now_ms,
            duration_ms,
            version,
        };
        self.leases.insert(resource, lease.clone());
        Ok(lease)
    }

    /// Acquire at the current wall-clock time.
    pub fn acquire(
        &mut self,
        resource: ResourceKey,
        user: &UserInfo,
        duration_ms: u64,
    ) -> Result<Lease, LockDenied> {
        self.acquire_at(resource, user, duration_ms, epoch_millis())
    }

    /// Refresh a held lease: re-stamps `locked_at` and bumps the version.
    ///
    /// Returns `None` unless the caller owns the lease, presented the
    /// current version, and the lease has not expired: the CAS that makes
    /// a refresh from a stale holder a no-op.
    pub fn refresh_at(
        &mut self,
        resource: ResourceKey,
        user_id: Uuid,
        version: u64,
        now_ms: u64,
    ) -> Option<Lease> {
        let lease = self.leases.get(&resource)?;
        if lease.user_id != user_id || lease.version != version || lease.is_expired_at(now_ms) {
            return None;
        }

        let next_version = self.bump_version(resource);
        let lease = self.leases.get_mut(&resource)?;
        lease.locked_at_ms = now_ms;
        lease.version = next_version;
        Some(lease.clone())
    }

    /// Refresh at the current wall-clock time.
    pub fn refresh(&mut self, resource: ResourceKey, user_id: Uuid, version: u64) -> Option<Lease> {
        self.refresh_at(resource, user_id, version, epoch_millis())
    }

    /// Release a lease. Only the owner may release; returns whether a lease
    /// was removed.
    pub fn release(&mut self, resource: ResourceKey, user_id: Uuid) -> bool {
        match self.leases.get(&resource) {
            Some(lease) if lease.user_id == user_id => {
                self.leases.remove(&resource);
                true
            }
            _ => false,
        }
    }

    /// Clear a lease unconditionally, regardless of owner or expiry.
    ///
    /// The admin override: any caller may clear any lease. The removed
    /// lease is returned so the caller can broadcast the revocation.
    pub fn force_unlock(&mut self, resource: ResourceKey) -> Option<Lease> {
        self.leases.remove(&resource)
    }

    /// Current valid lease on a resource, if any.
    pub fn holder_at(&self, resource: ResourceKey, now_ms: u64) -> Option<&Lease> {
        self.leases
            .get(&resource)
            .filter(|l| !l.is_expired_at(now_ms))
    }

    /// Whether a valid lease held by someone other than `user_id` exists.
    pub fn is_locked_by_others_at(
        &self,
        resource: ResourceKey,
        user_id: Uuid,
        now_ms: u64,
    ) -> bool {
        self.holder_at(resource, now_ms)
            .map_or(false, |l| l.user_id != user_id)
    }

    /// Remove every expired lease, returning them for revocation broadcast.
    pub fn sweep_expired_at(&mut self, now_ms: u64) -> Vec<Lease> {
        let expired: Vec<ResourceKey> = self
            .leases
            .iter()
            .filter(|(_, l)| l.is_expired_at(now_ms))
            .map(|(k, _)| *k)
            .collect();

        expired
            .into_iter()
            .filter_map(|k| self.leases.remove(&k))
            .collect()
    }

    /// Number of leases currently tracked (valid or awaiting sweep).
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn bump_version(&mut self, resource: ResourceKey) -> u64 {
        let slot = self.versions.entry(resource).or_insert(0);
        *slot += 1;
        *slot
    }
}

/// Client-side editing state for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    PendingAcquire,
    Held,
    Refreshing,
    Released,
    Expired,
}

/// The client's view of a single resource's lease.
///
/// Driven entirely by server events; the client never decides a lock
/// outcome locally. `lease` may belong to another user, in which case
/// `is_locked_by_others` reports true while our own state stays `Unlocked`.
#[derive(Debug, Clone)]
pub struct EditorLock {
    user_id: Uuid,
    state: LockState,
    lease: Option<Lease>,
}

impl EditorLock {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            state: LockState::Unlocked,
            lease: None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// A request is in flight.
    pub fn begin_acquire(&mut self) {
        self.state = LockState::PendingAcquire;
    }

    /// A refresh is in flight for our held lease.
    pub fn begin_refresh(&mut self) {
        if self.state == LockState::Held {
            self.state = LockState::Refreshing;
        }
    }

    /// Server granted a lease on this resource (ours or another user's).
    pub fn on_grant(&mut self, lease: Lease) {
        if lease.user_id == self.user_id {
            self.state = LockState::Held;
        } else if matches!(self.state, LockState::Held | LockState::Refreshing) {
            // Someone else was granted the resource we thought we held:
            // our lease must have lapsed server-side.
            self.state = LockState::Expired;
        }
        self.lease = Some(lease);
    }

    /// Server denied our request.
    pub fn on_deny(&mut self, denied: &LockDenied, resource: ResourceKey) {
        if self.state == LockState::PendingAcquire {
            self.state = LockState::Unlocked;
        }
        // Remember the holder so is_locked_by_others answers correctly.
        self.lease = Some(Lease {
            resource,
            user_id: denied.held_by.user_id,
            user_name: denied.held_by.user_name.clone(),
            locked_at_ms: 0,
            duration_ms: denied.locked_until_ms,
            version: 0,
        });
    }

    /// We released our lease.
    pub fn on_release(&mut self) {
        if matches!(self.state, LockState::Held | LockState::Refreshing) {
            self.state = LockState::Released;
        }
        self.lease = None;
    }

    /// The lease on this resource was revoked (sweep or force-unlock).
    ///
    /// If it was ours, local editing ends in `Expired`: the lock was taken
    /// away rather than released by us.
    pub fn on_revoke(&mut self) {
        if matches!(self.state, LockState::Held | LockState::Refreshing) {
            self.state = LockState::Expired;
        }
        self.lease = None;
    }

    /// Another user released their lease on this resource.
    pub fn on_peer_release(&mut self) {
        if !self.is_editing() {
            self.lease = None;
        }
    }

    /// Whether we currently hold a valid, non-expired lease.
    pub fn has_valid_lock_at(&self, now_ms: u64) -> bool {
        matches!(self.state, LockState::Held | LockState::Refreshing)
            && self
                .lease
                .as_ref()
                .map_or(false, |l| l.user_id == self.user_id && !l.is_expired_at(now_ms))
    }

    pub fn has_valid_lock(&self) -> bool {
        self.has_valid_lock_at(epoch_millis())
    }

    /// Whether a valid lease held by another user is known.
    pub fn is_locked_by_others_at(&self, now_ms: u64) -> bool {
        self.lease
            .as_ref()
            .map_or(false, |l| l.user_id != self.user_id && !l.is_expired_at(now_ms))
    }

    pub fn is_locked_by_others(&self) -> bool {
        self.is_locked_by_others_at(epoch_millis())
    }

    /// Whether we are in an editing state (held or refreshing).
    pub fn is_editing(&self) -> bool {
        matches!(self.state, LockState::Held | LockState::Refreshing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResourceType;

    fn key() -> ResourceKey {
        ResourceKey::new(Uuid::new_v4(), ResourceType::Finding)
    }

    fn user(name: &str) -> UserInfo {
        UserInfo::new(name)
    }

    const MINUTE: u64 = 60_000;

    #[test]
    fn test_acquire_then_release_lifecycle() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let mut editor = EditorLock::new(alice.user_id);

        assert!(!editor.has_valid_lock_at(1_000));

        editor.begin_acquire();
        let lease = table.acquire_at(resource, &alice, 10 * MINUTE, 1_000).unwrap();
        editor.on_grant(lease);

        // Valid strictly between acquire and release
        assert!(editor.has_valid_lock_at(1_000));
        assert!(editor.has_valid_lock_at(1_000 + 9 * MINUTE));
        assert!(editor.is_editing());

        assert!(table.release(resource, alice.user_id));
        editor.on_release();

        assert_eq!(editor.state(), LockState::Released);
        assert!(!editor.has_valid_lock_at(2_000));
        assert!(!editor.is_editing());
    }

    #[test]
    fn test_own_acquire_not_locked_by_others() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let mut editor = EditorLock::new(alice.user_id);

        let lease = table.acquire_at(resource, &alice, 10 * MINUTE, 0).unwrap();
        editor.on_grant(lease);

        assert!(!editor.is_locked_by_others_at(0));
        assert!(!table.is_locked_by_others_at(resource, alice.user_id, 0));
    }

    #[test]
    fn test_one_minute_lease_expires_after_sixty_seconds() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let mut editor = EditorLock::new(alice.user_id);

        let lease = table.acquire_at(resource, &alice, MINUTE, 0).unwrap();
        editor.on_grant(lease.clone());

        assert!(!lease.is_expired_at(59_999));
        assert!(lease.is_expired_at(60_001));
        assert!(!editor.has_valid_lock_at(60_001));

        // Sweep revokes it and clears the owner's editing state
        let revoked = table.sweep_expired_at(60_001);
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].user_id, alice.user_id);

        editor.on_revoke();
        assert_eq!(editor.state(), LockState::Expired);
        assert!(!editor.is_editing());
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        // Two clients racing in the same tick: the server CAS grants
        // exactly one, unlike the advisory client-side scheme this
        // replaces.
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let bob = user("Bob");

        let granted = table.acquire_at(resource, &alice, 10 * MINUTE, 5_000);
        assert!(granted.is_ok());

        let denied = table.acquire_at(resource, &bob, 10 * MINUTE, 5_000);
        let denial = denied.unwrap_err();
        assert_eq!(denial.held_by.user_id, alice.user_id);
        assert_eq!(denial.locked_until_ms, 5_000 + 10 * MINUTE);
    }

    #[test]
    fn test_acquire_after_expiry_succeeds() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let bob = user("Bob");

        table.acquire_at(resource, &alice, MINUTE, 0).unwrap();
        // Bob is denied while the lease is valid...
        assert!(table.acquire_at(resource, &bob, MINUTE, 30_000).is_err());
        // ...and granted once it has lapsed, even before the sweep runs.
        let lease = table.acquire_at(resource, &bob, MINUTE, 61_000).unwrap();
        assert_eq!(lease.user_id, bob.user_id);
    }

    #[test]
    fn test_owner_reacquire_extends() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");

        let first = table.acquire_at(resource, &alice, MINUTE, 0).unwrap();
        let second = table.acquire_at(resource, &alice, 5 * MINUTE, 30_000).unwrap();

        assert_eq!(second.version, first.version + 1);
        assert_eq!(second.locked_until_ms(), 30_000 + 5 * MINUTE);
    }

    #[test]
    fn test_refresh_restamps_and_bumps_version() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");

        let lease = table.acquire_at(resource, &alice, 10 * MINUTE, 0).unwrap();
        let refreshed = table
            .refresh_at(resource, alice.user_id, lease.version, 5 * MINUTE)
            .unwrap();

        assert_eq!(refreshed.locked_at_ms, 5 * MINUTE);
        assert_eq!(refreshed.version, lease.version + 1);
        assert_eq!(refreshed.locked_until_ms(), 15 * MINUTE);
    }

    #[test]
    fn test_refresh_rejects_stale_version() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");

        let lease = table.acquire_at(resource, &alice, 10 * MINUTE, 0).unwrap();
        table
            .refresh_at(resource, alice.user_id, lease.version, 1_000)
            .unwrap();

        // Replaying the original version must fail the CAS
        assert!(table
            .refresh_at(resource, alice.user_id, lease.version, 2_000)
            .is_none());
    }

    #[test]
    fn test_refresh_rejects_non_owner_and_expired() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let bob = user("Bob");

        let lease = table.acquire_at(resource, &alice, MINUTE, 0).unwrap();

        assert!(table
            .refresh_at(resource, bob.user_id, lease.version, 1_000)
            .is_none());
        assert!(table
            .refresh_at(resource, alice.user_id, lease.version, 61_000)
            .is_none());
    }

    #[test]
    fn test_release_requires_ownership() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let bob = user("Bob");

        table.acquire_at(resource, &alice, MINUTE, 0).unwrap();
        assert!(!table.release(resource, bob.user_id));
        assert!(table.release(resource, alice.user_id));
        assert!(table.release(resource, alice.user_id) == false); // already gone
    }

    #[test]
    fn test_force_unlock_clears_unconditionally() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");

        table.acquire_at(resource, &alice, 10 * MINUTE, 0).unwrap();

        // Any caller, regardless of owner, valid or not
        let removed = table.force_unlock(resource).unwrap();
        assert_eq!(removed.user_id, alice.user_id);
        assert!(table.holder_at(resource, 1_000).is_none());

        // Idempotent on an unleased resource
        assert!(table.force_unlock(resource).is_none());
    }

    #[test]
    fn test_version_monotonic_across_release() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");

        let first = table.acquire_at(resource, &alice, MINUTE, 0).unwrap();
        table.release(resource, alice.user_id);
        let second = table.acquire_at(resource, &alice, MINUTE, 1_000).unwrap();

        assert!(second.version > first.version);
    }

    #[test]
    fn test_deny_updates_editor_view() {
        let mut table = LeaseTable::new();
        let resource = key();
        let alice = user("Alice");
        let bob = user("Bob");
        let mut editor = EditorLock::new(bob.user_id);

        table.acquire_at(resource, &alice, 10 * MINUTE, 0).unwrap();

        editor.begin_acquire();
        let denial = table
            .acquire_at(resource, &bob, 10 * MINUTE, 1_000)
            .unwrap_err();
        editor.on_deny(&denial, resource);

        assert_eq!(editor.state(), LockState::Unlocked);
        assert!(editor.is_locked_by_others_at(1_000));
        assert!(!editor.has_valid_lock_at(1_000));
    }

    #[test]
    fn test_grant_to_other_expires_our_view() {
        let resource = key();
        let alice = user("Alice");
        let bob = user("Bob");
        let mut editor = EditorLock::new(alice.user_id);

        editor.on_grant(Lease {
            resource,
            user_id: alice.user_id,
            user_name: alice.user_name.clone(),
            locked_at_ms: 0,
            duration_ms: MINUTE,
            version: 1,
        });
        assert!(editor.is_editing());

        // Server granted Bob after our lease lapsed server-side
        editor.on_grant(Lease {
            resource,
            user_id: bob.user_id,
            user_name: bob.user_name.clone(),
            locked_at_ms: 70_000,
            duration_ms: MINUTE,
            version: 2,
        });
        assert_eq!(editor.state(), LockState::Expired);
        assert!(editor.is_locked_by_others_at(80_000));
    }

    #[test]
    fn test_sweep_leaves_valid_leases() {
        let mut table = LeaseTable::new();
        let short = key();
        let long = key();
        let alice = user("Alice");

        table.acquire_at(short, &alice, MINUTE, 0).unwrap();
        table.acquire_at(long, &alice, 10 * MINUTE, 0).unwrap();

        let revoked = table.sweep_expired_at(2 * MINUTE);
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].resource, short);
        assert_eq!(table.len(), 1);
        assert!(table.holder_at(long, 2 * MINUTE).is_some());
    }
}
