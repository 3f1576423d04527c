//! Durable local persistence for the offline operation log.
//!
//! The client survives restarts by writing the full operation log to a
//! RocksDB database on every mutation and replaying it on startup.
//!
//! - [`oplog`]: RocksDB-backed operation log store (LZ4-compressed values)

pub mod oplog;

pub use oplog::{OpLogConfig, OpLogStore, StoreError};
