/// RocksDB-backed persistence for one replica.
///
/// Column families:
/// - `state`   — single `latest` slot holding the serialized CRDT
/// - `patches` — append-only patch log keyed by a big-endian sequence
///   number recovered from the last key on open
///
/// Exactly-once durability is not required: after a crash the replica
/// replays from `latest` and converges on anything it missed through
/// peer pulls.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Hlc;

const CF_STATE: &str = "state";
const CF_PATCHES: &str = "patches";
const LATEST_KEY: &[u8] = b"latest";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("missing column family '{0}'")]
    MissingColumnFamily(&'static str),
    #[error("record encoding failed: {0}")]
    Encode(String),
    #[error("record decoding failed: {0}")]
    Decode(String),
}

/// One entry of the patch log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatchRecord {
    timestamp: String,
    blob: Vec<u8>,
    summary: String,
}

pub struct PersistenceLog {
    db: DBWithThreadMode<MultiThreaded>,
    sequence: AtomicU64,
    path: PathBuf,
}

impl PersistenceLog {
    /// Open (or create) the database at `path`. Fatal at startup when
    /// this fails.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
            ColumnFamilyDescriptor::new(CF_PATCHES, Options::default()),
        ];
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, cfs)?;
        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            sequence: AtomicU64::new(sequence),
            path: path.to_path_buf(),
        })
    }

    /// Next patch sequence number: one past the highest key on disk.
    fn recover_sequence(db: &DBWithThreadMode<MultiThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_PATCHES) {
            Some(cf) => cf,
            None => return 0,
        };
        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    /// Replace the single `latest` state slot.
    pub fn save_state(&self, blob: &[u8]) -> Result<(), StorageError> {
        let cf = self.db
            .cf_handle(CF_STATE)
            .ok_or(StorageError::MissingColumnFamily(CF_STATE))?;
        self.db.put_cf(&cf, LATEST_KEY, blob)?;
        Ok(())
    }

    /// Load the `latest` state slot, if any.
    pub fn load_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.db
            .cf_handle(CF_STATE)
            .ok_or(StorageError::MissingColumnFamily(CF_STATE))?;
        Ok(self.db.get_cf(&cf, LATEST_KEY)?)
    }

    /// Append one patch to the log.
    pub fn append_patch(
        &self,
        timestamp: &Hlc,
        blob: &[u8],
        summary: &str,
    ) -> Result<u64, StorageError> {
        let cf = self.db
            .cf_handle(CF_PATCHES)
            .ok_or(StorageError::MissingColumnFamily(CF_PATCHES))?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let record = PatchRecord {
            timestamp: timestamp.to_string(),
            blob: blob.to_vec(),
            summary: summary.to_string(),
        };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        self.db.put_cf(&cf, seq.to_be_bytes(), encoded)?;
        Ok(seq)
    }

    /// Newest-first patch summaries, at most `limit` of them.
    pub fn read_patch_summaries(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let cf = self.db
            .cf_handle(CF_PATCHES)
            .ok_or(StorageError::MissingColumnFamily(CF_PATCHES))?;
        let mut summaries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::End) {
            if summaries.len() >= limit {
                break;
            }
            let (_, value) = item?;
            let (record, _): (PatchRecord, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StorageError::Decode(e.to_string()))?;
            summaries.push(record.summary);
        }
        Ok(summaries)
    }

    /// Drop the whole patch log.
    pub fn clear_patches(&self) -> Result<(), StorageError> {
        let cf = self.db
            .cf_handle(CF_PATCHES)
            .ok_or(StorageError::MissingColumnFamily(CF_PATCHES))?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch)?;
        self.sequence.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Drop state and patches.
    pub fn reset(&self) -> Result<(), StorageError> {
        {
            let cf = self.db
                .cf_handle(CF_STATE)
                .ok_or(StorageError::MissingColumnFamily(CF_STATE))?;
            self.db.delete_cf(&cf, LATEST_KEY)?;
        }
        self.clear_patches()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
