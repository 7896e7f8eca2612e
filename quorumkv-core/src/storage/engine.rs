use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use parking_lot::RwLock;

/// In-memory hash map engine. Clones share the same underlying map.
pub struct StorageEngine<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    data: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> StorageEngine<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.data.write().insert(key, value);
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    pub fn delete(&self, key: &K) -> Result<Option<V>, String> {
        Ok(self.data.write().remove(key))
    }

    /// Copy of every pair, taken under one read lock.
    pub fn scan(&self) -> Result<Vec<(K, V)>, String> {
        Ok(self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl<K, V> Clone for StorageEngine<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<K, V> Default for StorageEngine<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
