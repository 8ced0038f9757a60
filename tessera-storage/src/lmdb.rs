//! LMDB-backed store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Every write runs in its
//! own write transaction; LMDB serializes writers, which is what makes
//! `create_if_absent` atomic and lets the batch operations commit as a
//! unit.

use std::ops::Bound;
use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tessera_core::{StoreError, TesseraError, TesseraResult};

use crate::kv::{Capabilities, KvStore};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for TesseraError {
    fn from(e: LmdbStoreError) -> Self {
        TesseraError::Store(StoreError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// Ordered, batch-capable store over a single unnamed LMDB database.
///
/// # Example
///
/// ```ignore
/// use tessera_storage::{KvStore, LmdbKvStore};
///
/// let store = LmdbKvStore::open("/tmp/tessera", 64)?;
/// store.set("article:1", bytes).await?;
/// ```
pub struct LmdbKvStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbKvStore {
    /// Open (creating if needed) a store in `path` with a map of
    /// `max_size_mb` megabytes.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process and
        // the memory map is never accessed outside heed's transactions.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self { env, db })
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let value = self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(txn_err)?
            .map(|v| v.to_vec());
        Ok(value)
    }
}

#[async_trait]
impl KvStore for LmdbKvStore {
    fn name(&self) -> &str {
        "lmdb"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            batch: true,
            ordered: true,
        }
    }

    async fn get(&self, key: &str) -> TesseraResult<Option<Vec<u8>>> {
        Ok(self.read(key)?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &value)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> TesseraResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self
            .db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> TesseraResult<bool> {
        // The write transaction is exclusive, so check-then-put cannot race.
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let exists = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(txn_err)?
            .is_some();
        if exists {
            wtxn.abort();
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), &value)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn get_many(&self, keys: &[String]) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self
                .db
                .get(&rtxn, key.as_bytes())
                .map_err(txn_err)?
                .map(|v| v.to_vec());
            out.push(value);
        }
        Ok(out)
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> TesseraResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for (key, value) in &entries {
            self.db
                .put(&mut wtxn, key.as_bytes(), value)
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> TesseraResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0;
        for key in keys {
            if self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn scan(&self, start: &str, end: &str) -> TesseraResult<Vec<(String, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let bounds = (
            Bound::Included(start.as_bytes()),
            Bound::Excluded(end.as_bytes()),
        );
        let range = self.db.range(&rtxn, &bounds).map_err(txn_err)?;

        let mut out = Vec::new();
        for result in range {
            let (key, value) = result.map_err(txn_err)?;
            let key = String::from_utf8(key.to_vec()).map_err(|e| StoreError::Backend {
                operation: "scan".to_string(),
                reason: e.to_string(),
            })?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbKvStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbKvStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _dir) = create_test_store();
        store.set("article:1", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get("article:1").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.get("article:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let (store, _dir) = create_test_store();
        store.set("k", b"1".to_vec()).await.unwrap();
        store.set("k", b"2".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"2".to_vec()));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let (store, _dir) = create_test_store();
        assert!(store.create_if_absent("lock:a", b"h1".to_vec()).await.unwrap());
        assert!(!store.create_if_absent("lock:a", b"h2".to_vec()).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some(b"h1".to_vec()));
    }

    #[tokio::test]
    async fn test_batches_and_scan() {
        let (store, _dir) = create_test_store();
        store
            .set_many(vec![
                ("doc:1".to_string(), b"a".to_vec()),
                ("doc:2".to_string(), b"b".to_vec()),
                ("tag:x".to_string(), b"c".to_vec()),
            ])
            .await
            .unwrap();

        let scanned = store.scan("doc:", "doc;").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, "doc:1");

        let keys = vec!["doc:1".to_string(), "doc:9".to_string()];
        assert_eq!(store.get_many(&keys).await.unwrap()[1], None);
        assert_eq!(store.delete_many(&keys).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_bounds() {
        let (store, _dir) = create_test_store();
        store
            .set_many(vec![
                ("doc:0".to_string(), b"a".to_vec()),
                ("doc:1".to_string(), b"b".to_vec()),
                ("doc:2".to_string(), b"c".to_vec()),
                ("doc:3".to_string(), b"d".to_vec()),
            ])
            .await
            .unwrap();

        let scanned = store.scan("doc:1", "doc:3").await.unwrap();
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["doc:1", "doc:2"]);
        assert_eq!(scanned[1].1, b"c".to_vec());

        assert!(store.scan("doc:3", "doc:1").await.unwrap().is_empty());
        assert!(store.scan("doc:2", "doc:2").await.unwrap().is_empty());
    }
}
