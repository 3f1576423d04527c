//! RocksDB-backed store for the offline operation log.
//!
//! Column families:
//! - `ops`:  queued operations, keyed by position (8 bytes big-endian),
//!           LZ4-compressed bincode values
//! - `meta`: sync bookkeeping (last successful flush timestamp)
//!
//! The full log is rewritten atomically on every mutation: offline queues
//! are small (field data for one audit), so whole-log writes stay cheap and
//! keep the on-disk state an exact mirror of memory. A corrupt value found
//! during load is discarded and logged rather than failing recovery.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::PathBuf;

use crate::sync::Operation;

const CF_OPS: &str = "ops";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_OPS, CF_META];

const META_LAST_SYNCED: &[u8] = b"last_synced_at_ms";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct OpLogConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB, the log is small)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: true, this is the only copy
    /// of unsynced field data)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit_offline_data"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl OpLogConfig {
    /// Create config for testing (temp directory, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            ..Self::default()
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed operation log store.
pub struct OpLogStore {
    /// RocksDB instance (single-threaded mode: concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: OpLogConfig,
}

impl OpLogStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: OpLogConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &OpLogConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed by us; skip double compression
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    /// Persist the full log, replacing whatever was stored before.
    ///
    /// One atomic WriteBatch: deletes the previous entries and writes the
    /// current ops in queue order.
    pub fn save_log(&self, ops: &[Operation]) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPS)?;

        let mut batch = WriteBatch::default();

        // Clear previous entries
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            batch.delete_cf(&cf, &key);
        }

        for (position, op) in ops.iter().enumerate() {
            let encoded = bincode::serde::encode_to_vec(op, bincode::config::standard())
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            let compressed = lz4_flex::compress_prepend_size(&encoded);
            batch.put_cf(&cf, (position as u64).to_be_bytes(), &compressed);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load the persisted log in queue order.
    ///
    /// A value that fails decompression or decode is discarded with a
    /// warning: one corrupt entry must not take the rest of the queue
    /// down with it.
    pub fn load_log(&self) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let mut ops = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            let decompressed = match lz4_flex::decompress_size_prepended(&value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Discarding corrupt op log entry {key:?}: {e}");
                    continue;
                }
            };

            match bincode::serde::decode_from_slice::<Operation, _>(
                &decompressed,
                bincode::config::standard(),
            ) {
                Ok((op, _)) => ops.push(op),
                Err(e) => {
                    log::warn!("Discarding undecodable op log entry {key:?}: {e}");
                }
            }
        }

        Ok(ops)
    }

    /// Number of persisted operations.
    pub fn op_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Record the time of the last successful flush.
    pub fn set_last_synced(&self, at_ms: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, META_LAST_SYNCED, at_ms.to_be_bytes());
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Time of the last successful flush, if any.
    pub fn last_synced(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, META_LAST_SYNCED)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            _ => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family {name}")))
    }

    #[cfg(test)]
    fn put_raw(&self, key: u64, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPS)?;
        self.db.put_cf(&cf, key.to_be_bytes(), value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{FieldRecord, OfflineLog, RecordBody};
    use uuid::Uuid;

    fn sample_log(n: usize) -> OfflineLog {
        let mut log = OfflineLog::new();
        for i in 0..n {
            log.upsert_at(
                FieldRecord {
                    id: String::new(),
                    audit_id: Uuid::new_v4(),
                    body: RecordBody::DataPoint {
                        name: format!("Meter {i}"),
                        value: i as f64,
                        unit: "kWh".into(),
                        recorded_at_ms: 1_000 + i as u64,
                    },
                    updated_at_ms: 0,
                },
                1_000 + i as u64,
            );
        }
        log
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = OpLogStore::open(OpLogConfig::for_testing(dir.path().join("db"))).unwrap();

        let log = sample_log(5);
        store.save_log(log.ops()).unwrap();

        let loaded = store.load_log().unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded, log.ops());
    }

    #[test]
    fn test_save_replaces_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = OpLogStore::open(OpLogConfig::for_testing(dir.path().join("db"))).unwrap();

        store.save_log(sample_log(5).ops()).unwrap();
        store.save_log(sample_log(2).ops()).unwrap();

        assert_eq!(store.op_count().unwrap(), 2);
    }

    #[test]
    fn test_empty_save_clears_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = OpLogStore::open(OpLogConfig::for_testing(dir.path().join("db"))).unwrap();

        store.save_log(sample_log(3).ops()).unwrap();
        store.save_log(&[]).unwrap();

        assert_eq!(store.op_count().unwrap(), 0);
        assert!(store.load_log().unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let log = sample_log(3);

        {
            let store = OpLogStore::open(OpLogConfig::for_testing(&path)).unwrap();
            store.save_log(log.ops()).unwrap();
            store.set_last_synced(99_000).unwrap();
        }

        let store = OpLogStore::open(OpLogConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load_log().unwrap(), log.ops());
        assert_eq!(store.last_synced().unwrap(), Some(99_000));
    }

    #[test]
    fn test_corrupt_entry_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = OpLogStore::open(OpLogConfig::for_testing(dir.path().join("db"))).unwrap();

        let log = sample_log(2);
        store.save_log(log.ops()).unwrap();
        // Garbage where a compressed op should be: a 4-byte size prefix
        // followed by bytes that are not a valid LZ4 block
        store.put_raw(99, &[4, 0, 0, 0, 0xFF, 0xFF]).unwrap();

        let loaded = store.load_log().unwrap();
        assert_eq!(loaded.len(), 2, "corrupt entry should be skipped, not fatal");
    }

    #[test]
    fn test_last_synced_initially_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = OpLogStore::open(OpLogConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(store.last_synced().unwrap(), None);
    }
}
