//! Tessera Core
//!
//! Pure types and pure logic for mapping entities onto a plain key-value
//! store: the key codec, entity model accessor, predicate evaluator,
//! operation batches and the index reconciler. Nothing in this crate does
//! I/O; `tessera-storage` drives stores with these types.

pub mod batch;
pub mod config;
pub mod entity;
pub mod error;
pub mod key;
pub mod predicate;
pub mod reconcile;
pub mod value;

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a fresh revision token (UUIDv7, so tokens sort by creation time).
pub fn new_revision_token() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub use batch::{ChangeSet, EntityOp, OperationBatch};
pub use config::{
    CacheConfig, CommitConfig, LockConfig, MissingEntityPolicy, PoolConfig, TesseraConfig,
};
pub use entity::{Attributes, ChangeTracker, MappedEntity, NoReferences, ReferenceResolver};
pub use error::{ConfigError, KeyError, QueryError, StoreError, TesseraError, TesseraResult};
pub use key::{canonical_timestamp, normalize, Key, KeyPart, KeyTemplate, NULL_SENTINEL, SEPARATOR};
pub use predicate::{resolve_path, AttributePath, CompareOp, Operand, Predicate, Quantifier};
pub use reconcile::reconcile;
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_tokens_are_unique() {
        let a = new_revision_token();
        let b = new_revision_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
