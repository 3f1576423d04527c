//! WebSocket session server with per-audit rooms and lease arbitration.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── SessionRoom (audit_id) ── SessionGroup (fan-out)
//! Client B ──┘            │
//!                         ├── LeaseTable   (edit locks, CAS-arbitrated)
//!                         ├── Roster       (presence snapshot for joiners)
//!                         └── Records      (authoritative field data)
//! ```
//!
//! The server is the source of truth for locks: every acquire/refresh goes
//! through the room's [`LeaseTable`], and outcomes are either broadcast
//! (grants, releases, revocations: stamped with the room sequence) or sent
//! back to the requester alone (denials, sync acks, snapshots). A periodic
//! sweep revokes expired leases and announces the revocation, so no client
//! has to discover expiry by its own timer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::SessionGroup;
use crate::lock::{LeaseTable, LockRefresh, LockRequest, LockRevoked, LEASE_SWEEP_INTERVAL_SECS};
use crate::presence::UserPresence;
use crate::protocol::{epoch_millis, MessageType, ResourceKey, SessionMessage, UserInfo};
use crate::sync::{
    FieldRecord, OpKind, OpOutcome, OpResult, RecordBody, SyncAck, SyncBatch,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum users per session room
    pub max_users_per_session: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Interval between lease expiry sweeps, in seconds
    pub lease_sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_users_per_session: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            lease_sweep_interval_secs: LEASE_SWEEP_INTERVAL_SECS,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub locks_granted: u64,
    pub locks_denied: u64,
    pub locks_revoked: u64,
    pub ops_applied: u64,
    pub ops_failed: u64,
}

/// Session room: fan-out group + lease table + authoritative records.
struct SessionRoom {
    group: Arc<SessionGroup>,
    leases: LeaseTable,
    roster: HashMap<Uuid, UserPresence>,
    records: HashMap<String, FieldRecord>,
}

impl SessionRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            group: Arc::new(SessionGroup::new(broadcast_capacity)),
            leases: LeaseTable::new(),
            roster: HashMap::new(),
            records: HashMap::new(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, SessionRoom>>>;

/// The session server.
pub struct SessionServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

impl SessionServer {
    /// Create a new session server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop and the lease expiry sweep. Call from an async
    /// runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.config.bind_addr);

        // Lease expiry sweep: revokes lapsed leases and announces each one
        let sweep_rooms = self.rooms.clone();
        let sweep_stats = self.stats.clone();
        let sweep_interval = self.config.lease_sweep_interval_secs;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(sweep_interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::sweep_leases(&sweep_rooms, &sweep_stats).await;
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// One sweep pass over every room's lease table.
    async fn sweep_leases(rooms: &Rooms, stats: &Arc<RwLock<ServerStats>>) {
        let now = epoch_millis();
        let mut revoked = 0u64;

        let mut rooms_w = rooms.write().await;
        for (audit_id, room) in rooms_w.iter_mut() {
            for lease in room.leases.sweep_expired_at(now) {
                log::info!(
                    "Lease on {} held by {} expired in session {audit_id}",
                    lease.resource,
                    lease.user_name
                );
                let payload = LockRevoked { forced: false, by: None, version: lease.version };
                if let Ok(msg) = SessionMessage::with_payload(
                    MessageType::LockRevoke,
                    lease.user_id,
                    lease.resource,
                    &payload,
                ) {
                    let _ = room.group.publish(msg);
                }
                revoked += 1;
            }
        }
        drop(rooms_w);

        if revoked > 0 {
            stats.write().await.locks_revoked += revoked;
        }
    }

    /// Apply a sync batch against a room's record map.
    ///
    /// Each operation succeeds or fails on its own; a create with a temp
    /// id gets a server-assigned one, carried back in the ack.
    fn apply_batch(
        records: &mut HashMap<String, FieldRecord>,
        batch: &SyncBatch,
    ) -> (SyncAck, u64, u64) {
        let mut results = Vec::with_capacity(batch.ops.len());
        let (mut applied, mut failed) = (0u64, 0u64);

        for op in &batch.ops {
            let outcome = Self::apply_op(records, op);
            match &outcome {
                OpOutcome::Applied { .. } => applied += 1,
                OpOutcome::Failed { reason } => {
                    log::warn!("Rejected op {} on record {}: {reason}", op.op_id, op.record.id);
                    failed += 1;
                }
            }
            results.push(OpResult { op_id: op.op_id, outcome });
        }

        (SyncAck { results }, applied, failed)
    }

    fn apply_op(records: &mut HashMap<String, FieldRecord>, op: &crate::sync::Operation) -> OpOutcome {
        if let Some(reason) = Self::validate_record(&op.record) {
            return OpOutcome::Failed { reason };
        }

        match op.kind {
            OpKind::Create => {
                let mut record = op.record.clone();
                let assigned_id = if record.has_temp_id() || record.id.is_empty() {
                    let id = Uuid::new_v4().to_string();
                    record.id = id.clone();
                    Some(id)
                } else {
                    None
                };
                records.insert(record.id.clone(), record);
                OpOutcome::Applied { assigned_id }
            }
            OpKind::Update => {
                if op.record.has_temp_id() {
                    return OpOutcome::Failed {
                        reason: "update references an unreconciled temp id".into(),
                    };
                }
                records.insert(op.record.id.clone(), op.record.clone());
                OpOutcome::Applied { assigned_id: None }
            }
            OpKind::Delete => {
                if records.remove(&op.record.id).is_none() {
                    return OpOutcome::Failed { reason: "record not found".into() };
                }
                OpOutcome::Applied { assigned_id: None }
            }
        }
    }

    fn validate_record(record: &FieldRecord) -> Option<String> {
        match &record.body {
            RecordBody::DataPoint { value, unit, .. } => {
                if !value.is_finite() {
                    return Some("validation: value must be finite".into());
                }
                if unit.is_empty() {
                    return Some("validation: unit is required".into());
                }
            }
            RecordBody::Area { square_feet, .. } => {
                if !square_feet.is_finite() || *square_feet < 0.0 {
                    return Some("validation: square_feet must be non-negative".into());
                }
            }
            RecordBody::Finding { title, .. } => {
                if title.is_empty() {
                    return Some("validation: title is required".into());
                }
            }
        }
        None
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection, filled in by the Join message
        let mut user: Option<UserInfo> = None;
        let mut audit_id: Option<Uuid> = None;
        let mut session_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let session_msg = match SessionMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match session_msg.msg_type {
                                MessageType::Join => {
                                    let info = session_msg.decode_payload::<UserInfo>()
                                        .unwrap_or_else(|_| {
                                            UserInfo::with_id(session_msg.user_id, "Anonymous")
                                        });
                                    let session = session_msg.resource.resource_id;

                                    let (roster_snapshot, publish_result, room_count) = {
                                        let mut rooms_w = rooms.write().await;
                                        let room = rooms_w
                                            .entry(session)
                                            .or_insert_with(|| SessionRoom::new(config.broadcast_capacity));

                                        if room.group.member_count().await >= config.max_users_per_session {
                                            log::warn!(
                                                "Session {session} full ({} users), refusing {}",
                                                config.max_users_per_session,
                                                info.user_name
                                            );
                                            break;
                                        }

                                        let rx = room.group.add_member(info.clone()).await;
                                        session_rx = Some(rx);

                                        let presence = UserPresence::online(info.user_id, info.user_name.clone());
                                        room.roster.insert(info.user_id, presence.clone());

                                        // Announce the joiner to the room
                                        let publish_result = SessionMessage::with_payload(
                                            MessageType::Presence,
                                            info.user_id,
                                            session_msg.resource,
                                            &presence,
                                        ).map(|m| room.group.publish(m));

                                        let snapshot: Vec<UserPresence> =
                                            room.roster.values().cloned().collect();
                                        (snapshot, publish_result, rooms_w.len())
                                    };

                                    if let Err(e) = publish_result.and_then(|r| r) {
                                        log::warn!("Failed to announce join for {}: {e}", info.user_name);
                                    }

                                    // Authoritative roster straight to the joiner
                                    let roster_msg = SessionMessage::with_payload(
                                        MessageType::Roster,
                                        info.user_id,
                                        session_msg.resource,
                                        &roster_snapshot,
                                    )?;
                                    ws_sender.send(Message::Binary(roster_msg.encode()?.into())).await?;

                                    {
                                        let mut s = stats.write().await;
                                        s.active_sessions = room_count;
                                    }

                                    log::info!(
                                        "User {} ({}) joined session {session}",
                                        info.user_name, info.user_id
                                    );
                                    user = Some(info);
                                    audit_id = Some(session);
                                }

                                MessageType::Presence => {
                                    if let (Some(session), Ok(presence)) =
                                        (audit_id, session_msg.decode_payload::<UserPresence>())
                                    {
                                        let mut rooms_w = rooms.write().await;
                                        if let Some(room) = rooms_w.get_mut(&session) {
                                            room.roster.insert(presence.user_id, presence);
                                            let _ = room.group.publish(session_msg);
                                        }
                                    }
                                }

                                MessageType::LockRequest => {
                                    let (Some(session), Some(requester)) = (audit_id, user.as_ref()) else {
                                        continue;
                                    };
                                    let request = session_msg
                                        .decode_payload::<LockRequest>()
                                        .unwrap_or_default();

                                    let outcome = {
                                        let mut rooms_w = rooms.write().await;
                                        rooms_w.get_mut(&session).map(|room| {
                                            let result = room.leases.acquire(
                                                session_msg.resource,
                                                requester,
                                                request.duration_ms,
                                            );
                                            (result, room.group.clone())
                                        })
                                    };

                                    match outcome {
                                        Some((Ok(lease), group)) => {
                                            log::info!(
                                                "Granted lock on {} to {} (v{})",
                                                lease.resource, lease.user_name, lease.version
                                            );
                                            let grant = SessionMessage::with_payload(
                                                MessageType::LockGrant,
                                                lease.user_id,
                                                lease.resource,
                                                &lease,
                                            )?;
                                            let _ = group.publish(grant);
                                            stats.write().await.locks_granted += 1;
                                        }
                                        Some((Err(denied), _)) => {
                                            log::debug!(
                                                "Denied lock on {} to {}: held by {}",
                                                session_msg.resource,
                                                requester.user_name,
                                                denied.held_by.user_name
                                            );
                                            let deny = SessionMessage::with_payload(
                                                MessageType::LockDeny,
                                                requester.user_id,
                                                session_msg.resource,
                                                &denied,
                                            )?;
                                            ws_sender.send(Message::Binary(deny.encode()?.into())).await?;
                                            stats.write().await.locks_denied += 1;
                                        }
                                        None => {}
                                    }
                                }

                                MessageType::LockRefresh => {
                                    let (Some(session), Some(requester)) = (audit_id, user.as_ref()) else {
                                        continue;
                                    };
                                    let Ok(refresh) = session_msg.decode_payload::<LockRefresh>() else {
                                        continue;
                                    };

                                    let outcome = {
                                        let mut rooms_w = rooms.write().await;
                                        rooms_w.get_mut(&session).map(|room| {
                                            let result = room.leases.refresh(
                                                session_msg.resource,
                                                requester.user_id,
                                                refresh.version,
                                            );
                                            (result, room.group.clone())
                                        })
                                    };

                                    match outcome {
                                        Some((Some(lease), group)) => {
                                            let grant = SessionMessage::with_payload(
                                                MessageType::LockGrant,
                                                lease.user_id,
                                                lease.resource,
                                                &lease,
                                            )?;
                                            let _ = group.publish(grant);
                                        }
                                        Some((None, _)) => {
                                            // The lease is gone or the version is stale;
                                            // tell the requester their claim lapsed
                                            let revoked = LockRevoked {
                                                forced: false,
                                                by: None,
                                                version: refresh.version,
                                            };
                                            let msg = SessionMessage::with_payload(
                                                MessageType::LockRevoke,
                                                requester.user_id,
                                                session_msg.resource,
                                                &revoked,
                                            )?;
                                            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                                        }
                                        None => {}
                                    }
                                }

                                MessageType::LockRelease => {
                                    let (Some(session), Some(requester)) = (audit_id, user.as_ref()) else {
                                        continue;
                                    };
                                    let released = {
                                        let mut rooms_w = rooms.write().await;
                                        rooms_w.get_mut(&session).map(|room| {
                                            let ok = room.leases.release(
                                                session_msg.resource,
                                                requester.user_id,
                                            );
                                            (ok, room.group.clone())
                                        })
                                    };
                                    if let Some((true, group)) = released {
                                        log::info!(
                                            "{} released lock on {}",
                                            requester.user_name, session_msg.resource
                                        );
                                        let _ = group.publish(SessionMessage::new(
                                            MessageType::LockRelease,
                                            requester.user_id,
                                            session_msg.resource,
                                        ));
                                    }
                                }

                                MessageType::LockRevoke => {
                                    // Force-unlock request: clears any lease, no
                                    // ownership or permission check at this layer
                                    let (Some(session), Some(requester)) = (audit_id, user.as_ref()) else {
                                        continue;
                                    };
                                    let removed = {
                                        let mut rooms_w = rooms.write().await;
                                        rooms_w.get_mut(&session).map(|room| {
                                            (room.leases.force_unlock(session_msg.resource), room.group.clone())
                                        })
                                    };
                                    if let Some((lease, group)) = removed {
                                        let version = lease.as_ref().map_or(0, |l| l.version);
                                        if let Some(l) = &lease {
                                            log::warn!(
                                                "{} force-unlocked {} held by {}",
                                                requester.user_name, l.resource, l.user_name
                                            );
                                        }
                                        let revoked = LockRevoked {
                                            forced: true,
                                            by: Some(requester.user_id),
                                            version,
                                        };
                                        let msg = SessionMessage::with_payload(
                                            MessageType::LockRevoke,
                                            requester.user_id,
                                            session_msg.resource,
                                            &revoked,
                                        )?;
                                        let _ = group.publish(msg);
                                        stats.write().await.locks_revoked += 1;
                                    }
                                }

                                MessageType::SyncBatch => {
                                    let (Some(session), Some(requester)) = (audit_id, user.as_ref()) else {
                                        continue;
                                    };
                                    let Ok(batch) = session_msg.decode_payload::<SyncBatch>() else {
                                        log::warn!("Undecodable sync batch from {addr}");
                                        continue;
                                    };

                                    let ack = {
                                        let mut rooms_w = rooms.write().await;
                                        rooms_w.get_mut(&session).map(|room| {
                                            Self::apply_batch(&mut room.records, &batch)
                                        })
                                    };

                                    if let Some((ack, applied, failed)) = ack {
                                        log::info!(
                                            "Sync batch from {}: {applied} applied, {failed} failed",
                                            requester.user_name
                                        );
                                        {
                                            let mut s = stats.write().await;
                                            s.ops_applied += applied;
                                            s.ops_failed += failed;
                                        }
                                        let reply = SessionMessage::with_payload(
                                            MessageType::SyncAck,
                                            requester.user_id,
                                            session_msg.resource,
                                            &ack,
                                        )?;
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }

                                MessageType::RecordsRequest => {
                                    let (Some(session), Some(requester)) = (audit_id, user.as_ref()) else {
                                        continue;
                                    };
                                    let snapshot: Option<Vec<FieldRecord>> = {
                                        let rooms_r = rooms.read().await;
                                        rooms_r.get(&session).map(|room| {
                                            room.records.values().cloned().collect()
                                        })
                                    };
                                    if let Some(records) = snapshot {
                                        let reply = SessionMessage::with_payload(
                                            MessageType::RecordsSnapshot,
                                            requester.user_id,
                                            session_msg.resource,
                                            &records,
                                        )?;
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SessionMessage::pong(session_msg.user_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }

                                other => {
                                    log::debug!("Unhandled message type from {addr}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing session frame
                msg = async {
                    if let Some(ref mut rx) = session_rx {
                        rx.recv().await
                    } else {
                        // Not joined yet: wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Suppress only the sender's own presence echo;
                            // lock and sync frames must reach their requester
                            if let Ok(frame) = SessionMessage::decode(&data) {
                                let own = user.as_ref().map(|u| u.user_id) == Some(frame.user_id);
                                if own && frame.msg_type == MessageType::Presence {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session member {user:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: remove the user from their room
        if let (Some(info), Some(session)) = (user, audit_id) {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&session) {
                room.group.remove_member(&info.user_id).await;
                room.roster.remove(&info.user_id);

                let _ = room.group.publish(SessionMessage::new(
                    MessageType::Leave,
                    info.user_id,
                    ResourceKey::audit(session),
                ));

                // Leases are not force-released on disconnect; they lapse
                // through the sweep so a quick reconnect keeps the claim
                if room.group.member_count().await == 0 {
                    rooms_w.remove(&session);
                    log::info!("Session {session} removed (empty)");
                }
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_sessions = rooms_w.len();
        } else {
            stats.write().await.active_connections -= 1;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Current valid lease on a resource within a session, if any.
    pub async fn lease_holder(&self, session: Uuid, resource: ResourceKey) -> Option<UserInfo> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&session)?;
        room.leases
            .holder_at(resource, epoch_millis())
            .map(|l| UserInfo::with_id(l.user_id, l.user_name.clone()))
    }

    /// Number of records held for a session (testing/monitoring).
    pub async fn record_count(&self, session: Uuid) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&session).map_or(0, |room| room.records.len())
    }
}
