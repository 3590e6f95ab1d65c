//! RocksDB-backed persistent store.
//!
//! Column families:
//! - `documents`     — Document rows without content (bincode)
//! - `content`       — Current snapshot per document (LZ4 compressed)
//! - `collaborators` — Grants keyed by `doc_id:user_id` (bincode)
//! - `events`        — Edit log keyed by `doc_id:version` (bincode, JSON payload)
//! - `metadata`      — Store-wide counters (next document id)
//!
//! Integer keys are big-endian so that iteration order matches numeric order
//! within a document. The latest version of a document is found with a single
//! reverse seek.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Collaborator, Document, DocumentStore, EditEvent, EventLog, Head, StoreError};
use crate::protocol::{unix_timestamp, DocumentId, Permission, UserId};

const CF_DOCUMENTS: &str = "documents";
const CF_CONTENT: &str = "content";
const CF_COLLABORATORS: &str = "collaborators";
const CF_EVENTS: &str = "events";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[
    CF_DOCUMENTS,
    CF_CONTENT,
    CF_COLLABORATORS,
    CF_EVENTS,
    CF_METADATA,
];

const NEXT_DOCUMENT_ID: &[u8] = b"next_document_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

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

#[derive(Serialize, Deserialize)]
struct DocumentRecord {
    title: String,
    content_type: String,
    owner_id: UserId,
    created_at: i64,
    updated_at: i64,
}

#[derive(Serialize, Deserialize)]
struct CollaboratorRecord {
    permission: Permission,
    created_at: i64,
}

#[derive(Serialize, Deserialize)]
struct EventRecord {
    user_id: UserId,
    event_type: String,
    /// JSON text; bincode cannot carry a self-describing value
    payload: String,
    created_at: i64,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

fn doc_key(id: DocumentId) -> [u8; 8] {
    id.to_be_bytes()
}

/// `doc_id` (8 bytes) + `suffix` (8 bytes), both big-endian.
fn pair_key(id: DocumentId, suffix: [u8; 8]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&id.to_be_bytes());
    key[8..].copy_from_slice(&suffix);
    key
}

fn event_key(id: DocumentId, version: u64) -> [u8; 16] {
    pair_key(id, version.to_be_bytes())
}

fn collaborator_key(id: DocumentId, user_id: UserId) -> [u8; 16] {
    pair_key(id, user_id.to_be_bytes())
}

fn suffix_of(key: &[u8]) -> Option<[u8; 8]> {
    key.get(8..16)?.try_into().ok()
}

/// RocksDB-backed implementation of [`DocumentStore`] and [`EventLog`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-check-write sequences (id allocation, version
    /// uniqueness, snapshot and version moving together)
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CONTENT => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_EVENTS => {
                // Many small appends, scanned newest first
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("store write lock poisoned".into()))
    }

    fn load_record(&self, id: DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_key(id))? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load_content(&self, id: DocumentId) -> Result<String, StoreError> {
        let cf = self.cf(CF_CONTENT)?;
        match self.db.get_cf(cf, doc_key(id))? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                String::from_utf8(raw).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            None => Ok(String::new()),
        }
    }

    fn read_latest_version(&self, document_id: DocumentId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let prefix = doc_key(document_id);
        let seek = event_key(document_id, u64::MAX);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&seek, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    return Ok(0);
                }
                Ok(suffix_of(&key).map_or(0, u64::from_be_bytes))
            }
            None => Ok(0),
        }
    }

    fn event_value(event: &EditEvent) -> Result<Vec<u8>, StoreError> {
        encode(&EventRecord {
            user_id: event.user_id,
            event_type: event.event_type.clone(),
            payload: serde_json::to_string(&event.payload)?,
            created_at: event.created_at,
        })
    }

    fn next_document_id(&self) -> Result<DocumentId, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let current = match self.db.get_cf(cf, NEXT_DOCUMENT_ID)? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("invalid document counter".into()))?;
                i64::from_be_bytes(buf)
            }
            None => 0,
        };
        Ok(current + 1)
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn create_document(&self, title: &str, owner_id: UserId) -> Result<Document, StoreError> {
        let _guard = self.lock()?;
        let id = self.next_document_id()?;
        let document = Document::new(id, title, owner_id);

        let record = DocumentRecord {
            title: document.title.clone(),
            content_type: document.content_type.clone(),
            owner_id,
            created_at: document.created_at,
            updated_at: document.updated_at,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc_key(id), encode(&record)?);
        batch.put_cf(
            self.cf(CF_CONTENT)?,
            doc_key(id),
            lz4_flex::compress_prepend_size(b""),
        );
        batch.put_cf(self.cf(CF_METADATA)?, NEXT_DOCUMENT_ID, id.to_be_bytes());
        self.write(batch)?;

        log::debug!("Created document {id} for user {owner_id}");
        Ok(document)
    }

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let Some(record) = self.load_record(id)? else {
            return Ok(None);
        };
        Ok(Some(Document {
            id,
            title: record.title,
            content: self.load_content(id)?,
            content_type: record.content_type,
            owner_id: record.owner_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }))
    }

    async fn content(&self, id: DocumentId) -> Result<String, StoreError> {
        if self.load_record(id)?.is_none() {
            return Err(StoreError::DocumentNotFound(id));
        }
        self.load_content(id)
    }

    async fn set_content(&self, id: DocumentId, content: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut record = self
            .load_record(id)?
            .ok_or(StoreError::DocumentNotFound(id))?;
        record.updated_at = unix_timestamp();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_CONTENT)?,
            doc_key(id),
            lz4_flex::compress_prepend_size(content.as_bytes()),
        );
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc_key(id), encode(&record)?);
        self.write(batch)
    }

    async fn owner(&self, id: DocumentId) -> Result<Option<UserId>, StoreError> {
        Ok(self.load_record(id)?.map(|r| r.owner_id))
    }

    async fn collaborator_permission(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Option<Permission>, StoreError> {
        let cf = self.cf(CF_COLLABORATORS)?;
        match self.db.get_cf(cf, collaborator_key(document_id, user_id))? {
            Some(bytes) => Ok(Some(decode::<CollaboratorRecord>(&bytes)?.permission)),
            None => Ok(None),
        }
    }

    async fn upsert_collaborator(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        permission: Permission,
    ) -> Result<(), StoreError> {
        if self.load_record(document_id)?.is_none() {
            return Err(StoreError::DocumentNotFound(document_id));
        }
        let cf = self.cf(CF_COLLABORATORS)?;
        let key = collaborator_key(document_id, user_id);

        let _guard = self.lock()?;
        let created_at = match self.db.get_cf(cf, key)? {
            Some(bytes) => decode::<CollaboratorRecord>(&bytes)?.created_at,
            None => unix_timestamp(),
        };
        let record = CollaboratorRecord {
            permission,
            created_at,
        };
        self.db.put_cf(cf, key, encode(&record)?)?;
        Ok(())
    }

    async fn remove_collaborator(
        &self,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let cf = self.cf(CF_COLLABORATORS)?;
        let key = collaborator_key(document_id, user_id);

        let _guard = self.lock()?;
        if self.db.get_cf(cf, key)?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(cf, key)?;
        Ok(true)
    }

    async fn collaborators(&self, document_id: DocumentId) -> Result<Vec<Collaborator>, StoreError> {
        let cf = self.cf(CF_COLLABORATORS)?;
        let prefix = doc_key(document_id);
        let mut collaborators = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(suffix) = suffix_of(&key) else {
                continue;
            };
            let record: CollaboratorRecord = decode(&value)?;
            collaborators.push(Collaborator {
                document_id,
                user_id: UserId::from_be_bytes(suffix),
                permission: record.permission,
                created_at: record.created_at,
            });
        }

        Ok(collaborators)
    }
}

#[async_trait]
impl EventLog for RocksStore {
    async fn latest_version(&self, document_id: DocumentId) -> Result<u64, StoreError> {
        self.read_latest_version(document_id)
    }

    async fn append(&self, event: &EditEvent) -> Result<(), StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let key = event_key(event.document_id, event.version);
        let value = Self::event_value(event)?;

        let _guard = self.lock()?;
        if self.db.get_cf(cf, key)?.is_some() {
            return Err(StoreError::VersionConflict {
                document_id: event.document_id,
                version: event.version,
            });
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key, value, &write_opts)?;
        Ok(())
    }

    async fn head(&self, document_id: DocumentId) -> Result<Head, StoreError> {
        let _guard = self.lock()?;
        if self.load_record(document_id)?.is_none() {
            return Err(StoreError::DocumentNotFound(document_id));
        }
        Ok(Head {
            content: self.load_content(document_id)?,
            version: self.read_latest_version(document_id)?,
        })
    }

    async fn commit_edit(&self, event: &EditEvent, content: &str) -> Result<(), StoreError> {
        let document_id = event.document_id;
        let value = Self::event_value(event)?;
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        let _guard = self.lock()?;
        let mut record = self
            .load_record(document_id)?
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        if event.version != self.read_latest_version(document_id)? + 1 {
            return Err(StoreError::VersionConflict {
                document_id,
                version: event.version,
            });
        }
        record.updated_at = unix_timestamp();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_EVENTS)?,
            event_key(document_id, event.version),
            value,
        );
        batch.put_cf(self.cf(CF_CONTENT)?, doc_key(document_id), compressed);
        batch.put_cf(self.cf(CF_DOCUMENTS)?, doc_key(document_id), encode(&record)?);
        self.write(batch)
    }

    async fn events(
        &self,
        document_id: DocumentId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EditEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let prefix = doc_key(document_id);
        let seek = event_key(document_id, u64::MAX);
        let mut events = Vec::with_capacity(limit.min(1024));

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&seek, Direction::Reverse));
        for item in iter.skip(offset) {
            if events.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(suffix) = suffix_of(&key) else {
                continue;
            };
            let record: EventRecord = decode(&value)?;
            events.push(EditEvent {
                document_id,
                user_id: record.user_id,
                event_type: record.event_type,
                version: u64::from_be_bytes(suffix),
                payload: serde_json::from_str(&record.payload)?,
                created_at: record.created_at,
            });
        }

        Ok(events)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
