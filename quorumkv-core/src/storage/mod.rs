//! Local key-value storage.
//!
//! The FSM speaks a byte-oriented contract ([`LocalStore`]); [`KvStore`] is
//! the in-memory engine behind it. [`SharedStore`] is the single lock every
//! reader and writer of the key space goes through.

pub mod engine;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
pub use engine::StorageEngine;

/// String key-value engine used by default.
pub type KvStore = StorageEngine<String, String>;

/// Point lookups, mutations and a full scan over a key space.
///
/// Deleting an absent key is not an error.
pub trait LocalStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Every key-value pair currently stored, in no particular order.
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

fn utf8(bytes: &[u8], what: &'static str) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::InvalidUtf8(what))
}

impl LocalStore for KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let key = utf8(key, "key")?;
        StorageEngine::get(self, &key)
            .map(|value| value.map(String::into_bytes))
            .map_err(StoreError::Engine)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let key = utf8(key, "key")?;
        let value = utf8(value, "value")?;
        StorageEngine::set(self, key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let key = utf8(key, "key")?;
        StorageEngine::delete(self, &key)
            .map(|_| ())
            .map_err(StoreError::Engine)
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        StorageEngine::scan(self)
            .map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.into_bytes(), v.into_bytes()))
                    .collect()
            })
            .map_err(StoreError::Engine)
    }
}

/// A local store behind one reader-writer lock.
///
/// Writers (apply, restore) take it exclusively. Readers (`get`, snapshot
/// iteration) take it shared, which still excludes any writer.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<RwLock<Box<dyn LocalStore>>>,
}

impl SharedStore {
    pub fn new(store: impl LocalStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Box::new(store))),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.read().get(key)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Box<dyn LocalStore>> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<dyn LocalStore>> {
        self.inner.write()
    }
}
