//! In-memory store for tests and single-process use.

use crate::kv::{Capabilities, KvStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tessera_core::{StoreError, TesseraResult};

/// Ordered in-memory store. Clones share the same data, so a clone acts as
/// a second client connected to the same backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKvStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> TesseraResult<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.data.read().map_err(|_| StoreError::LockPoisoned.into())
    }

    fn write(&self) -> TesseraResult<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.data.write().map_err(|_| StoreError::LockPoisoned.into())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data
            .read()
            .map(|d| d.contains_key(key))
            .unwrap_or(false)
    }

    /// Every stored key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.data
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the full contents, for before/after comparisons.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.read().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut data) = self.data.write() {
            data.clear();
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            batch: true,
            ordered: true,
        }
    }

    async fn get(&self, key: &str) -> TesseraResult<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        self.write()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> TesseraResult<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> TesseraResult<bool> {
        let mut data = self.write()?;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), value);
        Ok(true)
    }

    async fn get_many(&self, keys: &[String]) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        let data = self.read()?;
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> TesseraResult<()> {
        let mut data = self.write()?;
        data.extend(entries);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> TesseraResult<u64> {
        let mut data = self.write()?;
        Ok(keys.iter().filter(|k| data.remove(*k).is_some()).count() as u64)
    }

    async fn scan(&self, start: &str, end: &str) -> TesseraResult<Vec<(String, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let data = self.read()?;
        Ok(data
            .range(start.to_string()..end.to_string())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
