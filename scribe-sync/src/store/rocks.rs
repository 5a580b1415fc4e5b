//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: full yrs snapshots (LZ4 compressed), keyed by document id
//! - `metadata`: bincode-encoded [`DocumentMetadata`], keyed by document id
//!
//! A record exists iff its metadata row exists. Snapshot and metadata are
//! always written in one `WriteBatch`. Check-then-write operations hold
//! `write_lock` so concurrent creates of the same id cannot both succeed.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DocumentRecord, DocumentStore, DocumentSummary, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, direct edits must be durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync. For tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Everything about a document except its snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub scope_id: String,
    pub name: String,
    pub created_at: u64,
    pub updated_at: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

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

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Load metadata only.
    pub fn load_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, meta: &DocumentMetadata, compressed: &[u8]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, meta.id.as_bytes(), compressed);
        batch.put_cf(cf_meta, meta.id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn insert_if_absent(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if self.load_metadata(&record.id)?.is_some() {
            return Err(StoreError::Conflict(record.id.clone()));
        }

        let compressed = lz4_flex::compress_prepend_size(&record.snapshot);
        let meta = DocumentMetadata {
            id: record.id.clone(),
            scope_id: record.scope_id.clone(),
            name: record.name.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            snapshot_size: record.snapshot.len() as u64,
            compressed_size: compressed.len() as u64,
        };
        self.write_record(&meta, &compressed)
    }

    fn get(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let meta = match self.load_metadata(id)? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let cf = self.cf(CF_DOCUMENTS)?;
        let snapshot = match self.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(Some(DocumentRecord {
            id: meta.id,
            scope_id: meta.scope_id,
            name: meta.name,
            snapshot,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }))
    }

    fn update_snapshot(
        &self,
        id: &str,
        snapshot: &[u8],
        updated_at: u64,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let mut meta = match self.load_metadata(id)? {
            Some(meta) => meta,
            None => return Ok(false),
        };

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = updated_at;
        self.write_record(&meta, &compressed)?;
        Ok(true)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        if self.load_metadata(id)?.is_none() {
            return Ok(false);
        }

        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, id.as_bytes());
        batch.delete_cf(cf_meta, id.as_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(true)
    }

    fn list_by_scope(&self, scope_id: &str) -> Result<Vec<DocumentSummary>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut summaries = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = DocumentMetadata::decode(&value)?;
            if meta.scope_id == scope_id {
                summaries.push(DocumentSummary {
                    id: meta.id,
                    name: meta.name,
                });
            }
        }

        Ok(summaries)
    }
}
