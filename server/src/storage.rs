//! Durable key-value storage for accounts and chunks.
//!
//! Everything the server persists goes through [`GameDatabase`]. The production
//! backend is a single fjall partition; every write is synced before it
//! returns so an acknowledged mutation survives a crash.

use crate::error::StorageError;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use log::info;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::ChunkCoord;
use std::collections::HashMap;
use std::path::Path;

const PARTITION_NAME: &str = "tileworld";

pub trait GameDatabase: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `value` under `key`. Must be durable once this returns `Ok`.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

pub const WORLD_SEED_KEY: &str = "world-seed";

pub fn user_key(username: &str) -> String {
    format!("user-{}", username)
}

pub fn chunk_key(coord: ChunkCoord) -> String {
    format!("chunk-{}-{}", coord.x, coord.y)
}

/// Reads and decodes a bincode record.
pub fn get_record<T: DeserializeOwned>(
    db: &dyn GameDatabase,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match db.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub fn put_record<T: Serialize>(
    db: &dyn GameDatabase,
    key: &str,
    record: &T,
) -> Result<(), StorageError> {
    let bytes = bincode::serialize(record).map_err(StorageError::Encode)?;
    db.put(key, &bytes)
}

pub struct FjallDatabase {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallDatabase {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening world database at {:?}", path);
        let keyspace = Config::new(path).open()?;
        let partition = keyspace.open_partition(PARTITION_NAME, PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            partition,
        })
    }
}

impl GameDatabase for FjallDatabase {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.partition.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.partition.insert(key, value)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

/// Non-durable backend for tests and throwaway worlds.
#[derive(Default)]
pub struct MemoryDatabase {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl GameDatabase for MemoryDatabase {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
