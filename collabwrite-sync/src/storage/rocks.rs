//! RocksDB-backed persistence gateway.
//!
//! Column families:
//! - `checkpoints`: Latest checkpoint per document (bincode + LZ4)
//! - `oplog`      : Committed operations, keyed by doc_id:revision
//! - `versions`   : Named version history, keyed by doc_id:revision
//! - `metadata`   : Per-document metadata (revision, sizes, timestamps)
//!
//! Keys are `<doc_id:16 bytes>` or `<doc_id:16 bytes><revision:8 bytes BE>`,
//! so a forward scan from `doc_id:rev` yields that document's entries in
//! revision order.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use collabwrite_core::codec::{decode_compressed, encode, encode_compressed};
use collabwrite_core::Committed;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{unix_now, Checkpoint, PersistenceGateway, StoreError};

const CF_CHECKPOINTS: &str = "checkpoints";
const CF_OPLOG: &str = "oplog";
const CF_VERSIONS: &str = "versions";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CHECKPOINTS, CF_OPLOG, CF_VERSIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collabwrite_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
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

/// Metadata stored alongside each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: Uuid,
    /// Highest logged revision
    pub revision: u64,
    /// Revision of the stored checkpoint
    pub checkpoint_revision: u64,
    /// Uncompressed checkpoint size in bytes
    pub checkpoint_size: u64,
    /// Compressed checkpoint size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            document_id,
            revision: 0,
            checkpoint_revision: 0,
            checkpoint_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// RocksDB-backed [`PersistenceGateway`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4-compressed.
            CF_CHECKPOINTS | CF_VERSIONS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_OPLOG => {
                // Many small writes, prefix-scanned by doc_id
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Load document metadata, if the document exists.
    pub fn load_metadata(&self, document_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(collabwrite_core::codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Keys of `cf` for `document_id` with revision in `[from, to)`.
    fn scan_keys(
        &self,
        cf: &rocksdb::ColumnFamily,
        document_id: Uuid,
        from: u64,
        to: u64,
    ) -> Result<Vec<Box<[u8]>>, StoreError> {
        let start = revision_key(document_id, from);
        let end = revision_key(document_id, to);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != 24
                || &key[..16] != document_id.as_bytes()
                || key.as_ref() >= end.as_slice()
            {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl PersistenceGateway for RocksStore {
    fn load_latest(&self, document_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_compressed(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, document_id: Uuid, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let cf_checkpoints = self.cf(CF_CHECKPOINTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_oplog = self.cf(CF_OPLOG)?;

        let mut meta = self
            .load_metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        if let Some(stored) = self.load_latest(document_id)? {
            if stored.revision > checkpoint.revision {
                return Err(StoreError::StaleCheckpoint {
                    document_id,
                    stored: stored.revision,
                    offered: checkpoint.revision,
                });
            }
        }

        let raw_size = encode(checkpoint)?.len() as u64;
        let compressed = encode_compressed(checkpoint)?;
        meta.checkpoint_revision = checkpoint.revision;
        meta.revision = meta.revision.max(checkpoint.revision);
        meta.checkpoint_size = raw_size;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        // Checkpoint, metadata and log compaction land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_checkpoints, document_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, document_id.as_bytes(), encode(&meta)?);
        let compacted = self.scan_keys(cf_oplog, document_id, 0, checkpoint.revision + 1)?;
        for key in &compacted {
            batch.delete_cf(cf_oplog, key);
        }
        self.write(batch)?;

        log::debug!(
            "Checkpoint doc {document_id} at revision {} ({} bytes, {} log entries compacted)",
            checkpoint.revision,
            meta.compressed_size,
            compacted.len()
        );
        Ok(())
    }

    fn append_log(&self, document_id: Uuid, entries: &[Committed]) -> Result<(), StoreError> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let cf_oplog = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        meta.revision = meta.revision.max(last.revision);
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        for committed in entries {
            batch.put_cf(
                cf_oplog,
                revision_key(document_id, committed.revision),
                encode_compressed(committed)?,
            );
        }
        batch.put_cf(cf_meta, document_id.as_bytes(), encode(&meta)?);
        self.write(batch)
    }

    fn load_log_since(
        &self,
        document_id: Uuid,
        revision: u64,
    ) -> Result<Vec<Committed>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let start = revision_key(document_id, revision.saturating_add(1));

        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            entries.push(decode_compressed::<Committed>(&value)?);
        }
        Ok(entries)
    }

    fn truncate_log_after(&self, document_id: Uuid, revision: u64) -> Result<(), StoreError> {
        let cf_oplog = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let stale = self.scan_keys(cf_oplog, document_id, revision.saturating_add(1), u64::MAX)?;
        if stale.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for key in &stale {
            batch.delete_cf(cf_oplog, key);
        }
        if let Some(mut meta) = self.load_metadata(document_id)? {
            meta.revision = meta.revision.min(revision);
            meta.updated_at = unix_now();
            batch.put_cf(cf_meta, document_id.as_bytes(), encode(&meta)?);
        }
        self.write(batch)?;

        log::warn!(
            "Dropped {} log entries after revision {revision} for doc {document_id}",
            stale.len()
        );
        Ok(())
    }

    fn save_version(
        &self,
        document_id: Uuid,
        checkpoint: &Checkpoint,
        keep: usize,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_VERSIONS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            revision_key(document_id, checkpoint.revision),
            encode_compressed(checkpoint)?,
        );

        // Existing versions oldest first; the new one is about to be added.
        let existing = self.scan_keys(cf, document_id, 0, checkpoint.revision)?;
        let excess = (existing.len() + 1).saturating_sub(keep);
        for key in existing.iter().take(excess) {
            batch.delete_cf(cf, key);
        }
        self.write(batch)
    }

    fn list_versions(&self, document_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let start = revision_key(document_id, 0);

        let mut versions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            versions.push(decode_compressed::<Checkpoint>(&value)?);
        }
        versions.reverse();
        Ok(versions)
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Corrupt("invalid document key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

/// `doc_id` (16 bytes) followed by the big-endian revision.
fn revision_key(document_id: Uuid, revision: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
