//! Key-value store abstraction.
//!
//! Every backend Tessera drives implements [`KvStore`]. The trait is the
//! narrow surface the lock manager, commit engine and cache tier need:
//! point reads and writes, an atomic create-if-absent for locking, and
//! optional batch and range operations advertised through
//! [`Capabilities`].
//!
//! Keys are the flat strings produced by `Key::encode`.

use async_trait::async_trait;
use std::sync::Arc;
use tessera_core::{TesseraError, TesseraResult};

/// What a backend can do beyond point operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `get_many`/`set_many`/`delete_many` run as one backend round trip.
    pub batch: bool,
    /// Keys are ordered and [`KvStore::scan`] is supported.
    pub ordered: bool,
}

/// Plain key-value store.
///
/// The batch methods have sequential default implementations so a backend
/// only needs the point operations; backends with native batching override
/// them and report `Capabilities::batch`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logs and `Unsupported` errors.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn get(&self, key: &str) -> TesseraResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> TesseraResult<()>;

    /// Returns whether a value was present.
    async fn delete(&self, key: &str) -> TesseraResult<bool>;

    /// Write `value` only if `key` is absent. Returns whether the write
    /// happened. Must be atomic: two concurrent callers never both win.
    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> TesseraResult<bool>;

    async fn get_many(&self, keys: &[String]) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> TesseraResult<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    /// Returns how many keys were present.
    async fn delete_many(&self, keys: &[String]) -> TesseraResult<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Entries with `start <= key < end`, in key order.
    async fn scan(&self, start: &str, end: &str) -> TesseraResult<Vec<(String, Vec<u8>)>> {
        let _ = (start, end);
        Err(TesseraError::unsupported(self.name(), "range scan"))
    }
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    async fn get(&self, key: &str) -> TesseraResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> TesseraResult<bool> {
        (**self).delete(key).await
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> TesseraResult<bool> {
        (**self).create_if_absent(key, value).await
    }

    async fn get_many(&self, keys: &[String]) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        (**self).get_many(keys).await
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> TesseraResult<()> {
        (**self).set_many(entries).await
    }

    async fn delete_many(&self, keys: &[String]) -> TesseraResult<u64> {
        (**self).delete_many(keys).await
    }

    async fn scan(&self, start: &str, end: &str) -> TesseraResult<Vec<(String, Vec<u8>)>> {
        (**self).scan(start, end).await
    }
}
