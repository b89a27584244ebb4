//! # Datastore boundary
//!
//! The routing layer persists opaque records through [`Datastore`]. Keys and
//! values are byte strings; no format is assumed beyond that.
//! [`MemoryDatastore`] is the default, process-local implementation.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("datastore backend failure: {0}")]
    Backend(String),
    #[error("record exceeds maximum size ({size} > {max})")]
    TooLarge { size: usize, max: usize },
}

/// Key/value persistence consumed by the routing layer.
pub trait Datastore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatastoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatastoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), DatastoreError>;
    fn has(&self, key: &[u8]) -> Result<bool, DatastoreError>;
}

/// Largest value accepted by [`MemoryDatastore`].
pub const MAX_MEMORY_RECORD_SIZE: usize = 1024 * 1024;

#[derive(Default)]
pub struct MemoryDatastore {
    records: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatastoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatastoreError> {
        if value.len() > MAX_MEMORY_RECORD_SIZE {
            return Err(DatastoreError::TooLarge {
                size: value.len(),
                max: MAX_MEMORY_RECORD_SIZE,
            });
        }
        self.records.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), DatastoreError> {
        self.records.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool, DatastoreError> {
        Ok(self.records.read().contains_key(key))
    }
}
