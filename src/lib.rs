//! # audit-collab: collaborative session layer for field audits
//!
//! Real-time coordination for multi-user energy audit sessions over
//! WebSocket, with server-arbitrated edit locks and a durable offline
//! operation log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ SessionClient │ ◄────────────────► │ SessionServer │
//! │  (per user)   │    Binary Proto    │  (authority)  │
//! └──────┬────────┘                    └──────┬────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌───────────────┐                   ┌───────────────┐
//! │ OfflineLog    │                   │ SessionRoom   │
//! │ + OpLogStore  │                   │  LeaseTable   │
//! │ (durable)     │                   │  Roster       │
//! └───────────────┘                   │  Records      │
//!                                     └──────┬────────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ SessionGroup  │
//!                                    │  (fan-out)    │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded SessionMessage)
//! - [`channel`]: per-session fan-out with server-assigned sequence numbers
//! - [`presence`]: roster tracking with heartbeat-based away/offline rules
//! - [`lock`]: server-side lease table and client-side lock state machine
//! - [`sync`]: offline operation log and batch sync semantics
//! - [`storage`]: RocksDB-backed persistence for the offline log
//! - [`server`]: WebSocket session server
//! - [`client`]: WebSocket session client

pub mod protocol;
pub mod channel;
pub mod presence;
pub mod lock;
pub mod sync;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    epoch_millis, MessageType, ProtocolError, ResourceKey, ResourceType, SessionMessage, UserInfo,
};
pub use channel::{ChannelStats, SessionGroup, SessionManager};
pub use presence::{
    PresenceRoster, PresenceStatus, UserPresence, AWAY_AFTER_MS, HEARTBEAT_INTERVAL_MS,
};
pub use lock::{
    EditorLock, Lease, LeaseTable, LockDenied, LockRefresh, LockRequest, LockRevoked, LockState,
    DEFAULT_LOCK_MINUTES,
};
pub use sync::{
    AckSummary, FieldRecord, OfflineLog, OpKind, OpOutcome, OpResult, OpStatus, Operation,
    RecordBody, RecordKind, Severity, SyncAck, SyncBatch, SyncState,
};
pub use storage::{OpLogConfig, OpLogStore, StoreError};
pub use server::{ServerConfig, ServerStats, SessionServer};
pub use client::{ConnectionState, RetryPolicy, SessionClient, SessionEvent};
