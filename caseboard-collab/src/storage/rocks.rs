//! RocksDB-backed document store.
//!
//! Column families:
//! - `snapshots` — full replica states, LZ4 compressed, keyed by doc id
//! - `deltas`    — incremental updates, LZ4 compressed, keyed by
//!   `doc_id (16) ‖ version (8, big-endian)`
//! - `meta`      — per-document [`StoreMeta`] records (bincode)
//!
//! Writes are atomic batches; reads go through bloom filters and a
//! block cache. Hydration is snapshot + trailing deltas, so reopening a
//! document needs no network at all.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Log-Structured Storage)

use std::path::PathBuf;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use caseboard_core::{ReplicaDocument, ReplicaError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_DELTAS: &str = "deltas";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_DELTAS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB).
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10).
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false — the delta log bounds the
    /// loss window instead).
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256).
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB).
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("caseboard_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, temp-friendly; for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside the payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub doc_id: Uuid,
    /// Highest delta version ever written.
    pub version: u64,
    /// Delta version the current snapshot includes (compaction point).
    pub snapshot_version: u64,
    /// Deltas written since the current snapshot.
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes.
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes.
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl StoreMeta {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            version: 0,
            snapshot_version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

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

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors. Non-fatal for a session: the in-memory replica stays
/// authoritative and writes are retried.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(Uuid),
    Serialization(String),
    Deserialization(String),
    Compression(String),
    /// A persisted blob no longer applies to the replica.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Corrupt stored state: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<ReplicaError> for StoreError {
    fn from(e: ReplicaError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// The durable store for one or more board documents.
pub struct DocumentStore {
    /// Single-threaded mode; concurrency comes from tokio, not RocksDB.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open (creating if missing) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(4);
        db_opts.increase_parallelism(available_parallelism());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Payloads are LZ4-compressed by us already; keep RocksDB out of it.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Prefix scans by doc id.
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Missing column family {name}")))
    }

    fn delta_key(doc_id: Uuid, version: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(doc_id.as_bytes());
        key[16..].copy_from_slice(&version.to_be_bytes());
        key
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full snapshot covering everything up to `up_to_version`.
    /// Resets the since-snapshot delta counter.
    pub fn save_snapshot(
        &self,
        doc_id: Uuid,
        snapshot: &[u8],
        up_to_version: u64,
    ) -> Result<StoreMeta, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_meta(doc_id)
            .unwrap_or_else(|_| StoreMeta::new(doc_id));
        meta.snapshot_version = up_to_version;
        meta.version = meta.version.max(up_to_version);
        meta.delta_count = 0;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Load the full snapshot blob (LZ4 decompressed).
    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Append one incremental update at the given version.
    pub fn store_delta(&self, doc_id: Uuid, version: u64, delta: &[u8]) -> Result<(), StoreError> {
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(delta);

        let mut meta = self
            .load_meta(doc_id)
            .unwrap_or_else(|_| StoreMeta::new(doc_id));
        meta.version = meta.version.max(version);
        meta.delta_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, Self::delta_key(doc_id, version), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(())
    }

    /// Load all deltas with version >= `since_version`, in order.
    pub fn load_deltas_since(
        &self,
        doc_id: Uuid,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(doc_id, since_version);

        let mut deltas = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut version_bytes = [0u8; 8];
            version_bytes.copy_from_slice(&key[16..24]);
            let version = u64::from_be_bytes(version_bytes);

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            deltas.push((version, decompressed));
        }

        Ok(deltas)
    }

    /// Delete deltas up to and including `up_to_version` (after a
    /// snapshot has made them redundant). Returns how many went away.
    pub fn compact_deltas(&self, doc_id: Uuid, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let start_key = Self::delta_key(doc_id, 0);

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let mut version_bytes = [0u8; 8];
            version_bytes.copy_from_slice(&key[16..24]);
            if u64::from_be_bytes(version_bytes) > up_to_version {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_meta(&self, doc_id: Uuid) -> Result<StoreMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => StoreMeta::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    /// All document ids known to this store.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() == 16 {
                let bytes: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Deserialization("Bad uuid key".into()))?;
                ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    /// Remove a document with its snapshot, deltas and metadata.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;
        let cf_deltas = self.cf(CF_DELTAS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());

        let start_key = Self::delta_key(doc_id, 0);
        let iter = self.db.iterator_cf(
            &cf_deltas,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_deltas, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    // ─── Hydration ────────────────────────────────────────────────────

    /// Load a document's persisted state into a live replica: snapshot
    /// first, then every delta past the compaction point. Returns
    /// `false` when the store has never seen this document.
    pub fn hydrate_into(
        &self,
        doc_id: Uuid,
        replica: &ReplicaDocument,
    ) -> Result<bool, StoreError> {
        let meta = match self.load_meta(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match self.load_snapshot(doc_id) {
            Ok(snapshot) => replica.apply_state(&snapshot)?,
            Err(StoreError::NotFound(_)) => {} // deltas only, no snapshot yet
            Err(e) => return Err(e),
        }

        let deltas = self.load_deltas_since(doc_id, meta.snapshot_version + 1)?;
        for (version, delta) in deltas {
            if let Err(e) = replica.apply_update(&delta) {
                // One bad delta must not sink the rest of the log.
                log::error!("Skipping corrupt delta {version} for {doc_id}: {e}");
            }
        }

        Ok(true)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn available_parallelism() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseboard_core::model::BoardRecord;
    use caseboard_core::{Collection, Element};

    fn open_store(dir: &tempfile::TempDir) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn element_update(replica: &ReplicaDocument, element: &Element) -> Vec<u8> {
        let ((), update) = replica
            .transact(|t| {
                t.put_entity(Collection::Elements, element.id, &element.to_fields());
                Ok(())
            })
            .unwrap();
        update
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        let replica = ReplicaDocument::new();
        element_update(&replica, &Element::new("A", "person", 0.0, 0.0));
        let snapshot = replica.encode_state();

        let meta = store.save_snapshot(doc_id, &snapshot, 1).unwrap();
        assert_eq!(meta.snapshot_version, 1);
        assert_eq!(meta.snapshot_size, snapshot.len() as u64);

        assert_eq!(store.load_snapshot(doc_id).unwrap(), snapshot);
    }

    #[test]
    fn test_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        assert!(matches!(
            store.load_snapshot(doc_id),
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.document_exists(doc_id).unwrap());
    }

    #[test]
    fn test_delta_log_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        store.store_delta(doc_id, 1, b"one").unwrap();
        store.store_delta(doc_id, 2, b"two").unwrap();
        store.store_delta(doc_id, 3, b"three").unwrap();

        let deltas = store.load_deltas_since(doc_id, 2).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0], (2, b"two".to_vec()));
        assert_eq!(deltas[1], (3, b"three".to_vec()));

        let meta = store.load_meta(doc_id).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.delta_count, 3);
    }

    #[test]
    fn test_deltas_isolated_per_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        store.store_delta(doc_a, 1, b"a1").unwrap();
        store.store_delta(doc_b, 1, b"b1").unwrap();

        let deltas = store.load_deltas_since(doc_a, 0).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].1, b"a1".to_vec());
    }

    #[test]
    fn test_compaction_drops_covered_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        for version in 1..=5 {
            store.store_delta(doc_id, version, b"delta").unwrap();
        }
        let removed = store.compact_deltas(doc_id, 3).unwrap();
        assert_eq!(removed, 3);

        let remaining = store.load_deltas_since(doc_id, 0).unwrap();
        let versions: Vec<u64> = remaining.iter().map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[test]
    fn test_hydrate_snapshot_plus_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        let writer = ReplicaDocument::new();
        let a = Element::new("A", "person", 1.0, 1.0);
        element_update(&writer, &a);
        store
            .save_snapshot(doc_id, &writer.encode_state(), 1)
            .unwrap();

        let b = Element::new("B", "person", 2.0, 2.0);
        let update = element_update(&writer, &b);
        store.store_delta(doc_id, 2, &update).unwrap();

        let replica = ReplicaDocument::new();
        assert!(store.hydrate_into(doc_id, &replica).unwrap());
        assert!(replica.contains(Collection::Elements, a.id));
        assert!(replica.contains(Collection::Elements, b.id));
    }

    #[test]
    fn test_hydrate_unknown_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let replica = ReplicaDocument::new();
        assert!(!store.hydrate_into(Uuid::new_v4(), &replica).unwrap());
    }

    #[test]
    fn test_corrupt_delta_skipped_on_hydrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        let writer = ReplicaDocument::new();
        let a = Element::new("A", "person", 1.0, 1.0);
        let good = element_update(&writer, &a);
        store.store_delta(doc_id, 1, &good).unwrap();
        store.store_delta(doc_id, 2, &[0xFF, 0xFE, 0xFD]).unwrap();

        let replica = ReplicaDocument::new();
        assert!(store.hydrate_into(doc_id, &replica).unwrap());
        assert!(replica.contains(Collection::Elements, a.id));
    }

    #[test]
    fn test_delete_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_id = Uuid::new_v4();

        store.save_snapshot(doc_id, b"snapshot", 1).unwrap();
        store.store_delta(doc_id, 2, b"delta").unwrap();
        assert!(store.document_exists(doc_id).unwrap());

        store.delete_document(doc_id).unwrap();
        assert!(!store.document_exists(doc_id).unwrap());
        assert!(store.load_deltas_since(doc_id, 0).unwrap().is_empty());
    }

    #[test]
    fn test_list_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        store.store_delta(doc_a, 1, b"a").unwrap();
        store.store_delta(doc_b, 1, b"b").unwrap();

        let mut listed = store.list_documents().unwrap();
        listed.sort();
        let mut expected = vec![doc_a, doc_b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let doc_id = Uuid::new_v4();
        {
            let store = open_store(&dir);
            store.save_snapshot(doc_id, b"state", 1).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.load_snapshot(doc_id).unwrap(), b"state".to_vec());
    }
}
