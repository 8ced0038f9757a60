//! Tessera Storage
//!
//! Everything in Tessera that talks to a key-value store:
//!
//! - [`KvStore`]: the async store abstraction, with [`InMemoryKvStore`] and
//!   [`LmdbKvStore`] implementations and a per-worker [`ClientPool`]
//! - [`LockManager`]: store-resident locks with bounded retry and forced
//!   fallback
//! - [`CommitEngine`]: applies reconciled change-sets under locks
//! - [`CacheTier`]: composite-key query cache with integrity-tracked
//!   invalidation
//! - [`Datastore`]: the facade tying commit, query, cache and locks together

pub mod cache;
pub mod codec;
pub mod commit;
pub mod datastore;
pub mod kv;
pub mod lmdb;
pub mod lock;
pub mod memory;
pub mod pool;
pub mod refs;

pub use cache::{
    CacheLevel, CacheStats, CacheTier, FillTicket, InvalidationReport, QueryBase, QueryParams,
    SortDirection,
};
pub use codec::{EntitySerializer, JsonSerializer};
pub use commit::{CommitEngine, CommitReceipt};
pub use datastore::Datastore;
pub use kv::{Capabilities, KvStore};
pub use lmdb::{LmdbKvStore, LmdbStoreError};
pub use lock::{LockManager, LockOutcome, LockToken};
pub use memory::InMemoryKvStore;
pub use pool::{ClientPool, ConnectionArgs, PooledStore, WorkerId};
