//! Per-worker pool of store client handles.
//!
//! Handles are created lazily on first checkout and recycled when they sit
//! idle past `PoolConfig::idle_lifetime` or when the caller asks for
//! different connection arguments. [`PooledStore`] puts a pool behind the
//! [`KvStore`] trait so every operation runs on the current worker's handle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tessera_core::{PoolConfig, StoreError, TesseraResult};
use tracing::debug;

use crate::kv::{Capabilities, KvStore};

/// Identity of the worker a handle belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The calling OS thread.
    pub fn current_thread() -> Self {
        Self(format!("{:?}", std::thread::current().id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection arguments a handle was created with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionArgs(BTreeMap<String, String>);

impl ConnectionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

type Connect<C> = dyn Fn(&ConnectionArgs) -> TesseraResult<C> + Send + Sync;

struct PoolEntry<C> {
    client: Arc<C>,
    args: ConnectionArgs,
    last_used: Instant,
}

/// Lazily populated map of worker → client handle.
pub struct ClientPool<C> {
    connect: Box<Connect<C>>,
    entries: RwLock<HashMap<WorkerId, PoolEntry<C>>>,
    config: PoolConfig,
}

impl<C> ClientPool<C> {
    pub fn new<F>(config: PoolConfig, connect: F) -> Self
    where
        F: Fn(&ConnectionArgs) -> TesseraResult<C> + Send + Sync + 'static,
    {
        Self {
            connect: Box::new(connect),
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// The handle for `worker`, creating or recycling it as needed.
    pub fn checkout(&self, worker: &WorkerId, args: &ConnectionArgs) -> TesseraResult<Arc<C>> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = Instant::now();

        if let Some(entry) = entries.get_mut(worker) {
            let idle = now.duration_since(entry.last_used);
            if entry.args == *args && idle <= self.config.idle_lifetime {
                entry.last_used = now;
                return Ok(Arc::clone(&entry.client));
            }
            let reason = if entry.args != *args {
                "connection arguments changed"
            } else {
                "idle lifetime exceeded"
            };
            debug!(
                worker = %worker,
                reason,
                idle_ms = idle.as_millis() as u64,
                "recycling client handle"
            );
        }

        let client = Arc::new((self.connect)(args)?);
        entries.insert(
            worker.clone(),
            PoolEntry {
                client: Arc::clone(&client),
                args: args.clone(),
                last_used: now,
            },
        );
        Ok(client)
    }

    /// Drop every handle idle past its lifetime. Returns how many were dropped.
    pub fn evict_idle(&self) -> TesseraResult<usize> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.last_used) <= self.config.idle_lifetime);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted idle client handles");
        }
        Ok(evicted)
    }

    pub fn remove(&self, worker: &WorkerId) -> TesseraResult<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.remove(worker).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`KvStore`] that routes every call through the calling thread's pooled
/// handle.
pub struct PooledStore<C> {
    pool: ClientPool<C>,
    args: ConnectionArgs,
    name: String,
    capabilities: Capabilities,
}

impl<C: KvStore> PooledStore<C> {
    /// `capabilities` must describe the clients `pool` creates.
    pub fn new(
        pool: ClientPool<C>,
        args: ConnectionArgs,
        name: impl Into<String>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            pool,
            args,
            name: name.into(),
            capabilities,
        }
    }

    pub fn pool(&self) -> &ClientPool<C> {
        &self.pool
    }

    fn client(&self) -> TesseraResult<Arc<C>> {
        self.pool.checkout(&WorkerId::current_thread(), &self.args)
    }
}

#[async_trait]
impl<C: KvStore + 'static> KvStore for PooledStore<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn get(&self, key: &str) -> TesseraResult<Option<Vec<u8>>> {
        self.client()?.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        self.client()?.set(key, value).await
    }

    async fn delete(&self, key: &str) -> TesseraResult<bool> {
        self.client()?.delete(key).await
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> TesseraResult<bool> {
        self.client()?.create_if_absent(key, value).await
    }

    async fn get_many(&self, keys: &[String]) -> TesseraResult<Vec<Option<Vec<u8>>>> {
        self.client()?.get_many(keys).await
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> TesseraResult<()> {
        self.client()?.set_many(entries).await
    }

    async fn delete_many(&self, keys: &[String]) -> TesseraResult<u64> {
        self.client()?.delete_many(keys).await
    }

    async fn scan(&self, start: &str, end: &str) -> TesseraResult<Vec<(String, Vec<u8>)>> {
        self.client()?.scan(start, end).await
    }
}
