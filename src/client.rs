//! WebSocket session client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, retry with backoff, disconnect)
//! - Presence updates and a live roster of session members
//! - Edit-lock request/refresh/release with automatic half-life refresh
//! - Offline operation log, flushed as a batch on reconnect and persisted
//!   through [`OpLogStore`] so queued work survives a restart

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::lock::{EditorLock, LockDenied, LockRefresh, LockRequest, LockRevoked, Lease};
use crate::presence::{PresenceRoster, UserPresence};
use crate::protocol::{
    epoch_millis, MessageType, ProtocolError, ResourceKey, SessionMessage, UserInfo,
};
use crate::storage::OpLogStore;
use crate::sync::{
    AckSummary, FieldRecord, OfflineLog, RecordBody, Severity, SyncAck, SyncBatch, SyncState,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Retry policy for `connect_with_retry`: linear backoff, capped attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Events emitted by the session client.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A member's presence changed
    PresenceChanged(UserPresence),
    /// Authoritative roster received on join
    RosterReplaced(Vec<UserPresence>),
    /// A member left the session
    UserLeft(Uuid),
    /// A lease was granted (ours or another user's)
    LockGranted(Lease),
    /// Our lease request was denied
    LockDenied {
        resource: ResourceKey,
        denied: LockDenied,
    },
    /// Another user released their lease
    LockReleased { resource: ResourceKey, by: Uuid },
    /// A lease was revoked by the sweep or a force-unlock
    LockRevoked {
        resource: ResourceKey,
        revoked: LockRevoked,
    },
    /// An offline batch was acknowledged
    SyncCompleted(AckSummary),
    /// Authoritative record snapshot received
    Records(Vec<FieldRecord>),
}

/// Shared state the reader task keeps current for the application.
#[derive(Clone)]
struct SharedState {
    state: Arc<RwLock<ConnectionState>>,
    roster: Arc<Mutex<PresenceRoster>>,
    editor: Arc<RwLock<EditorLock>>,
    editing_resource: Arc<RwLock<Option<ResourceKey>>>,
    offline: Arc<Mutex<OfflineLog>>,
    sync_state: Arc<RwLock<SyncState>>,
    refresh_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    store: Option<Arc<OpLogStore>>,
}

/// The session client.
///
/// Manages a WebSocket connection to the session server, tracks presence
/// and lock state from server events, and owns the offline operation log.
pub struct SessionClient {
    /// Our identity
    user: UserInfo,

    /// Audit session we join
    audit_id: Uuid,

    /// Server URL
    server_url: String,

    shared: SharedState,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SessionEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionClient {
    /// Create a new session client with no persistent log.
    pub fn new(user: UserInfo, audit_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::build(user, audit_id, server_url.into(), None, OfflineLog::new(), None)
    }

    /// Create a client backed by a durable operation log.
    ///
    /// Operations queued in a previous run are loaded back; any left mid-sync
    /// return to pending so the next flush retries them.
    pub fn with_store(
        user: UserInfo,
        audit_id: Uuid,
        server_url: impl Into<String>,
        store: Arc<OpLogStore>,
    ) -> Self {
        let log = match store.load_log() {
            Ok(ops) => OfflineLog::from_ops(ops),
            Err(e) => {
                log::error!("Failed to load offline log: {e}");
                OfflineLog::new()
            }
        };
        let last_synced = store.last_synced().ok().flatten();
        Self::build(user, audit_id, server_url.into(), Some(store), log, last_synced)
    }

    fn build(
        user: UserInfo,
        audit_id: Uuid,
        server_url: String,
        store: Option<Arc<OpLogStore>>,
        log: OfflineLog,
        last_synced: Option<u64>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let mut sync_state = SyncState::default();
        sync_state.pending_sync = log.has_pending();
        sync_state.last_synced_at_ms = last_synced;

        Self {
            shared: SharedState {
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                roster: Arc::new(Mutex::new(PresenceRoster::new(user.user_id))),
                editor: Arc::new(RwLock::new(EditorLock::new(user.user_id))),
                editing_resource: Arc::new(RwLock::new(None)),
                offline: Arc::new(Mutex::new(log)),
                sync_state: Arc::new(RwLock::new(sync_state)),
                refresh_task: Arc::new(Mutex::new(None)),
                store,
            },
            user,
            audit_id,
            server_url,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the session.
    ///
    /// Spawns the writer and reader tasks, sends Join, and if operations
    /// are pending triggers exactly one offline flush.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.audit_id);
        let ws_result = tokio_tungstenite::connect_async(&url).await;

        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Connection to {url} failed: {e}");
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            // Every sender is gone: say goodbye so the server can clean up
            let _ = ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Close(None))
                .await;
        });

        // Join the session
        let join = SessionMessage::with_payload(
            MessageType::Join,
            self.user.user_id,
            ResourceKey::audit(self.audit_id),
            &self.user,
        )?;
        self.send_encoded(join.encode()?).await?;

        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SessionEvent::Connected).await;

        // Reader task: map server frames onto client state and events
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let user_id = self.user.user_id;
        let audit_id = self.audit_id;
        // Weak so that dropping the client tears the connection down:
        // the writer exits when every strong sender is gone
        let reader_tx = out_tx.downgrade();
        drop(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match SessionMessage::decode(&bytes) {
                            Ok(f) => f,
                            Err(e) => {
                                log::warn!("Undecodable frame from server: {e}");
                                continue;
                            }
                        };
                        Self::handle_frame(&shared, &event_tx, &reader_tx, user_id, audit_id, frame)
                            .await;
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            Self::on_connection_lost(&shared).await;
            let _ = event_tx.send(SessionEvent::Disconnected).await;
        });

        // Coming online with queued work triggers one flush
        if self.shared.offline.lock().await.has_pending() {
            self.sync_offline_data().await?;
        }

        Ok(())
    }

    /// Connect with retries.
    ///
    /// Waits `base_delay * attempt` between attempts, so a default policy
    /// backs off 500ms, 1s, 1.5s, 2s before giving up.
    pub async fn connect_with_retry(&mut self, policy: RetryPolicy) -> Result<(), ProtocolError> {
        for attempt in 1..=policy.max_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == policy.max_attempts => return Err(e),
                Err(_) => {
                    *self.shared.state.write().await = ConnectionState::Reconnecting;
                    let delay = policy.delay(attempt);
                    log::info!(
                        "Connect attempt {attempt}/{} failed, retrying in {delay:?}",
                        policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(ProtocolError::ConnectionClosed)
    }

    /// One incoming server frame.
    async fn handle_frame(
        shared: &SharedState,
        event_tx: &mpsc::Sender<SessionEvent>,
        out_tx: &mpsc::WeakSender<Vec<u8>>,
        user_id: Uuid,
        audit_id: Uuid,
        frame: SessionMessage,
    ) {
        let now = epoch_millis();
        match frame.msg_type {
            MessageType::Presence => {
                if let Ok(presence) = frame.decode_payload::<UserPresence>() {
                    shared.roster.lock().await.handle_update_at(presence.clone(), now);
                    let _ = event_tx.send(SessionEvent::PresenceChanged(presence)).await;
                }
            }

            MessageType::Roster => {
                if let Ok(roster) = frame.decode_payload::<Vec<UserPresence>>() {
                    shared.roster.lock().await.replace_all(roster.clone());
                    let _ = event_tx.send(SessionEvent::RosterReplaced(roster)).await;
                }
            }

            MessageType::Leave => {
                shared.roster.lock().await.remove(&frame.user_id);
                let _ = event_tx.send(SessionEvent::UserLeft(frame.user_id)).await;
            }

            MessageType::LockGrant => {
                let Ok(lease) = frame.decode_payload::<Lease>() else {
                    return;
                };
                let tracked = *shared.editing_resource.read().await;
                if tracked == Some(lease.resource) {
                    shared.editor.write().await.on_grant(lease.clone());
                    if lease.user_id == user_id {
                        Self::ensure_refresh_task(shared, out_tx, user_id, lease.resource).await;
                    }
                }
                let _ = event_tx.send(SessionEvent::LockGranted(lease)).await;
            }

            MessageType::LockDeny => {
                let Ok(denied) = frame.decode_payload::<LockDenied>() else {
                    return;
                };
                let tracked = *shared.editing_resource.read().await;
                if tracked == Some(frame.resource) {
                    shared.editor.write().await.on_deny(&denied, frame.resource);
                }
                let _ = event_tx
                    .send(SessionEvent::LockDenied { resource: frame.resource, denied })
                    .await;
            }

            MessageType::LockRelease => {
                if frame.user_id != user_id {
                    let tracked = *shared.editing_resource.read().await;
                    if tracked == Some(frame.resource) {
                        shared.editor.write().await.on_peer_release();
                    }
                    let _ = event_tx
                        .send(SessionEvent::LockReleased {
                            resource: frame.resource,
                            by: frame.user_id,
                        })
                        .await;
                }
            }

            MessageType::LockRevoke => {
                let Ok(revoked) = frame.decode_payload::<LockRevoked>() else {
                    return;
                };
                let tracked = *shared.editing_resource.read().await;
                if tracked == Some(frame.resource) {
                    let mut editor = shared.editor.write().await;
                    // A revocation carrying an older version than the lease
                    // we hold answers a refresh that was already superseded
                    // by a newer grant; the current lease stands
                    if editor.lease().map_or(false, |l| revoked.version < l.version) {
                        return;
                    }
                    let was_ours = editor.is_editing();
                    editor.on_revoke();
                    drop(editor);
                    if was_ours {
                        if let Some(handle) = shared.refresh_task.lock().await.take() {
                            handle.abort();
                        }
                    }
                }
                let _ = event_tx
                    .send(SessionEvent::LockRevoked { resource: frame.resource, revoked })
                    .await;
            }

            MessageType::SyncAck => {
                let Ok(ack) = frame.decode_payload::<SyncAck>() else {
                    return;
                };
                let summary = Self::apply_ack(shared, &ack, now).await;
                let _ = event_tx.send(SessionEvent::SyncCompleted(summary)).await;

                // Pull the authoritative record set after every flush
                let request = SessionMessage::new(
                    MessageType::RecordsRequest,
                    user_id,
                    ResourceKey::audit(audit_id),
                );
                if let (Ok(encoded), Some(tx)) = (request.encode(), out_tx.upgrade()) {
                    let _ = tx.send(encoded).await;
                }
            }

            MessageType::RecordsSnapshot => {
                if let Ok(records) = frame.decode_payload::<Vec<FieldRecord>>() {
                    let _ = event_tx.send(SessionEvent::Records(records)).await;
                }
            }

            MessageType::Pong => {}

            other => {
                log::debug!("Unhandled frame type {other:?}");
            }
        }
    }

    /// Tear down per-connection state after the socket drops.
    ///
    /// A batch on the wire will never be acked now, so its operations go
    /// back to pending and any stuck sync flag is cleared. Without this
    /// the reconnect flush would skip them until a process restart.
    async fn on_connection_lost(shared: &SharedState) {
        *shared.state.write().await = ConnectionState::Disconnected;
        if let Some(handle) = shared.refresh_task.lock().await.take() {
            handle.abort();
        }

        let still_pending = {
            let mut log = shared.offline.lock().await;
            log.reset_in_flight();
            if let Some(store) = &shared.store {
                if let Err(e) = store.save_log(log.ops()) {
                    log::error!("Failed to persist offline log: {e}");
                }
            }
            log.has_pending()
        };
        let mut sync = shared.sync_state.write().await;
        sync.syncing = false;
        sync.pending_sync = still_pending;
    }

    /// Fold a sync acknowledgement into the log, the sync state, and the
    /// durable store.
    async fn apply_ack(shared: &SharedState, ack: &SyncAck, now: u64) -> AckSummary {
        let mut log = shared.offline.lock().await;
        let summary = log.apply_ack(ack);
        let still_pending = log.has_pending();

        if let Some(store) = &shared.store {
            if let Err(e) = store.save_log(log.ops()) {
                log::error!("Failed to persist offline log: {e}");
            }
            if summary.failed == 0 {
                if let Err(e) = store.set_last_synced(now) {
                    log::error!("Failed to persist sync marker: {e}");
                }
            }
        }
        drop(log);

        let mut sync = shared.sync_state.write().await;
        if summary.failed > 0 {
            sync.fail(format!("{} operations rejected", summary.failed));
            sync.pending_sync = still_pending;
        } else {
            sync.complete_at(now, still_pending);
        }

        log::info!(
            "Sync acknowledged: {} applied, {} failed, {} ids reconciled",
            summary.applied,
            summary.failed,
            summary.id_mappings.len()
        );
        summary
    }

    /// Keep our lease alive by refreshing at half its duration.
    ///
    /// The task re-reads the lease each cycle, so version bumps from
    /// re-grants are picked up, and exits once the lock is no longer held.
    async fn ensure_refresh_task(
        shared: &SharedState,
        out_tx: &mpsc::WeakSender<Vec<u8>>,
        user_id: Uuid,
        resource: ResourceKey,
    ) {
        let mut slot = shared.refresh_task.lock().await;
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let editor = shared.editor.clone();
        let tx = out_tx.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                let interval = {
                    let guard = editor.read().await;
                    if !guard.has_valid_lock() {
                        break;
                    }
                    match guard.lease() {
                        Some(lease) => lease.duration_ms / 2,
                        None => break,
                    }
                };
                tokio::time::sleep(Duration::from_millis(interval)).await;

                // The version is read after the sleep: a manual refresh or
                // re-acquire in between bumps it, and presenting the old
                // one would fail the server's version check
                let version = {
                    let mut guard = editor.write().await;
                    if !guard.has_valid_lock() {
                        break;
                    }
                    let Some(version) = guard.lease().map(|l| l.version) else {
                        break;
                    };
                    guard.begin_refresh();
                    version
                };

                let msg = SessionMessage::with_payload(
                    MessageType::LockRefresh,
                    user_id,
                    resource,
                    &LockRefresh { version },
                );
                let sent = match (msg.and_then(|m| m.encode()), tx.upgrade()) {
                    (Ok(encoded), Some(tx)) => tx.send(encoded).await.is_ok(),
                    _ => false,
                };
                if !sent {
                    break;
                }
            }
        }));
    }

    // --- Offline data -----------------------------------------------------

    /// Queue a create or update, then flush immediately if connected.
    ///
    /// A record with an empty id gets a temporary one; the server assigns
    /// the real id during sync.
    pub async fn save_offline(&self, record: FieldRecord) -> Result<(), ProtocolError> {
        {
            let mut log = self.shared.offline.lock().await;
            let op = log.upsert(record);
            log::debug!("Queued {:?} for record {}", op.kind, op.record.id);
            self.persist_log(&log);
        }
        self.shared.sync_state.write().await.pending_sync = true;

        if self.connection_state().await == ConnectionState::Connected {
            self.sync_offline_data().await?;
        }
        Ok(())
    }

    /// Capture a new measurement for this audit.
    pub async fn save_data_point(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let now = epoch_millis();
        self.save_offline(FieldRecord {
            id: String::new(),
            audit_id: self.audit_id,
            body: RecordBody::DataPoint {
                name: name.into(),
                value,
                unit: unit.into(),
                recorded_at_ms: now,
            },
            updated_at_ms: now,
        })
        .await
    }

    /// Capture a building area for this audit.
    pub async fn save_area(
        &self,
        name: impl Into<String>,
        square_feet: f64,
    ) -> Result<(), ProtocolError> {
        self.save_offline(FieldRecord {
            id: String::new(),
            audit_id: self.audit_id,
            body: RecordBody::Area { name: name.into(), square_feet },
            updated_at_ms: epoch_millis(),
        })
        .await
    }

    /// Capture an audit finding.
    pub async fn save_finding(
        &self,
        title: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.save_offline(FieldRecord {
            id: String::new(),
            audit_id: self.audit_id,
            body: RecordBody::Finding {
                title: title.into(),
                severity,
                description: description.into(),
            },
            updated_at_ms: epoch_millis(),
        })
        .await
    }

    /// Queue a delete. Deleting a record that only exists as a queued
    /// create cancels both operations.
    pub async fn delete_record(&self, record: FieldRecord) -> Result<(), ProtocolError> {
        let queued = {
            let mut log = self.shared.offline.lock().await;
            let op = log.delete(record);
            self.persist_log(&log);
            op.is_some()
        };
        if queued {
            self.shared.sync_state.write().await.pending_sync = true;
            if self.connection_state().await == ConnectionState::Connected {
                self.sync_offline_data().await?;
            }
        }
        Ok(())
    }

    /// Flush pending operations as one batch.
    ///
    /// No-op unless connected, something is pending, and no flush is
    /// already in flight. Returns whether a batch was sent.
    pub async fn sync_offline_data(&self) -> Result<bool, ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(false);
        }
        {
            let sync = self.shared.sync_state.read().await;
            if sync.syncing || !sync.pending_sync {
                return Ok(false);
            }
        }

        let ops = {
            let mut log = self.shared.offline.lock().await;
            let ops = log.take_batch();
            self.persist_log(&log);
            ops
        };
        if ops.is_empty() {
            self.shared.sync_state.write().await.pending_sync = false;
            return Ok(false);
        }

        self.shared.sync_state.write().await.begin_sync();
        log::info!("Flushing {} offline operations", ops.len());

        let msg = SessionMessage::with_payload(
            MessageType::SyncBatch,
            self.user.user_id,
            ResourceKey::audit(self.audit_id),
            &SyncBatch { ops },
        )?;
        self.send_encoded(msg.encode()?).await?;
        Ok(true)
    }

    /// Flush now or fail. Unlike [`sync_offline_data`](Self::sync_offline_data),
    /// being offline is an error here.
    pub async fn force_sync(&self) -> Result<bool, ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Err(ProtocolError::Offline);
        }
        self.sync_offline_data().await
    }

    fn persist_log(&self, log: &OfflineLog) {
        if let Some(store) = &self.shared.store {
            if let Err(e) = store.save_log(log.ops()) {
                log::error!("Failed to persist offline log: {e}");
            }
        }
    }

    // --- Presence ---------------------------------------------------------

    /// Report user activity, broadcasting at most once per second unless
    /// the current view changed.
    pub async fn touch_activity(&self, view: Option<String>) -> Result<(), ProtocolError> {
        let update = {
            let mut roster = self.shared.roster.lock().await;
            roster.update_local_activity(&self.user.user_name, view)
        };
        let Some(presence) = update else {
            return Ok(());
        };
        if self.connection_state().await != ConnectionState::Connected {
            // Presence is ephemeral, nothing to queue
            return Ok(());
        }
        let msg = SessionMessage::with_payload(
            MessageType::Presence,
            self.user.user_id,
            ResourceKey::audit(self.audit_id),
            &presence,
        )?;
        self.send_encoded(msg.encode()?).await
    }

    /// Members currently known to the roster, the local idle rules applied.
    pub async fn active_users(&self) -> Vec<UserPresence> {
        let mut roster = self.shared.roster.lock().await;
        let now = epoch_millis();
        roster.mark_idle_at(now);
        roster.evict_stale_at(now);
        roster.active_users()
    }

    // --- Edit locks -------------------------------------------------------

    /// Request an edit lease on a resource.
    pub async fn request_lock(
        &self,
        resource: ResourceKey,
        request: LockRequest,
    ) -> Result<(), ProtocolError> {
        *self.shared.editing_resource.write().await = Some(resource);
        self.shared.editor.write().await.begin_acquire();

        let msg = SessionMessage::with_payload(
            MessageType::LockRequest,
            self.user.user_id,
            resource,
            &request,
        )?;
        self.send_encoded(msg.encode()?).await
    }

    /// Refresh our lease by hand, ahead of the scheduled half-life refresh.
    ///
    /// No-op unless we hold a valid lease. The server answers with a new
    /// grant, or a revocation if the version went stale.
    pub async fn refresh_lock(&self) -> Result<(), ProtocolError> {
        let refresh = {
            let mut editor = self.shared.editor.write().await;
            if !editor.has_valid_lock() {
                return Ok(());
            }
            let Some(lease) = editor.lease() else {
                return Ok(());
            };
            let payload = LockRefresh { version: lease.version };
            let resource = lease.resource;
            editor.begin_refresh();
            (payload, resource)
        };
        let msg = SessionMessage::with_payload(
            MessageType::LockRefresh,
            self.user.user_id,
            refresh.1,
            &refresh.0,
        )?;
        self.send_encoded(msg.encode()?).await
    }

    /// Release our lease and stop the auto-refresh.
    pub async fn release_lock(&self) -> Result<(), ProtocolError> {
        let resource = {
            let mut editor = self.shared.editor.write().await;
            if !editor.is_editing() {
                return Ok(());
            }
            let resource = editor.lease().map(|l| l.resource);
            editor.on_release();
            resource
        };
        if let Some(handle) = self.shared.refresh_task.lock().await.take() {
            handle.abort();
        }

        let Some(resource) = resource else {
            return Ok(());
        };
        let msg = SessionMessage::new(MessageType::LockRelease, self.user.user_id, resource);
        self.send_encoded(msg.encode()?).await
    }

    /// Clear any lease on a resource, whoever holds it. The server
    /// broadcasts the revocation to the whole session.
    pub async fn force_unlock(&self, resource: ResourceKey) -> Result<(), ProtocolError> {
        let msg = SessionMessage::new(MessageType::LockRevoke, self.user.user_id, resource);
        self.send_encoded(msg.encode()?).await
    }

    /// Whether we hold a valid lease on the tracked resource.
    pub async fn has_valid_lock(&self) -> bool {
        self.shared.editor.read().await.has_valid_lock()
    }

    /// Whether another user holds a valid lease on the tracked resource.
    pub async fn is_locked_by_others(&self) -> bool {
        self.shared.editor.read().await.is_locked_by_others()
    }

    // --- Accessors --------------------------------------------------------

    /// Disconnect from the server.
    ///
    /// The writer task sends a close frame once the channel drains, and
    /// the server announces our leave to the session.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        if let Some(handle) = self.shared.refresh_task.lock().await.take() {
            handle.abort();
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SessionMessage::new(
            MessageType::Ping,
            self.user.user_id,
            ResourceKey::audit(self.audit_id),
        );
        self.send_encoded(msg.encode()?).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Snapshot of the sync cycle state.
    pub async fn sync_state(&self) -> SyncState {
        self.shared.sync_state.read().await.clone()
    }

    /// Number of queued offline operations.
    pub async fn offline_len(&self) -> usize {
        self.shared.offline.lock().await.len()
    }

    /// Whether any operations await sync.
    pub async fn has_pending(&self) -> bool {
        self.shared.offline.lock().await.has_pending()
    }

    /// Get our user info.
    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// Get the audit session id.
    pub fn audit_id(&self) -> Uuid {
        self.audit_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn send_encoded(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::Offline),
        }
    }
}
