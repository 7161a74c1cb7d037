//! Room snapshot persistence.
//!
//! The relay server is the only caller: it fetches a snapshot when a room
//! is created and persists one periodically and when the room empties.
//!
//! RocksDB layout:
//! - `snapshots`: full document state per room (LZ4 compressed)
//! - `metadata`: [`SnapshotMetadata`] per room (bincode)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Snapshot persistence errors.
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for SnapshotError {
    fn from(e: rocksdb::Error) -> Self {
        SnapshotError::Database(e.to_string())
    }
}

/// Where room snapshots live.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot of `room_id`, if one was persisted.
    fn fetch_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, SnapshotError>;

    fn persist_snapshot(&self, room_id: &str, snapshot: &[u8]) -> Result<(), SnapshotError>;
}

/// Process-local snapshots. Lost on restart.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        crate::store::lock(&self.snapshots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn fetch_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
        Ok(crate::store::lock(&self.snapshots).get(room_id).cloned())
    }

    fn persist_snapshot(&self, room_id: &str, snapshot: &[u8]) -> Result<(), SnapshotError> {
        crate::store::lock(&self.snapshots).insert(room_id.to_string(), snapshot.to_vec());
        Ok(())
    }
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canopy_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub room_id: String,
    /// Number of times this room was persisted
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new(room_id: &str) -> Self {
        let now = now_secs();
        Self {
            room_id: room_id.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB-backed snapshot store with LZ4-compressed values.
pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, SnapshotError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Snapshot store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are compressed before they reach RocksDB.
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, SnapshotError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SnapshotError::Database(format!("Column family '{name}' not found")))
    }

    pub fn load_metadata(&self, room_id: &str) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of every room with a persisted snapshot.
    pub fn list_rooms(&self) -> Result<Vec<String>, SnapshotError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(room) => rooms.push(room),
                Err(_) => log::warn!("Skipping non-UTF-8 room key"),
            }
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room_id: &str) -> Result<(), SnapshotError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, room_id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn fetch_snapshot(&self, room_id: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| SnapshotError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn persist_snapshot(&self, room_id: &str, snapshot: &[u8]) -> Result<(), SnapshotError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(room_id)?
            .unwrap_or_else(|| SnapshotMetadata::new(room_id));
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        // Snapshot and metadata land together.
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, room_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, room_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Persisted room {} v{} ({} -> {} bytes)",
            room_id,
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}
