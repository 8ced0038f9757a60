//! Configuration types

use crate::error::{ConfigError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lock retry and fallback behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Create-if-absent attempts before giving up on clean acquisition.
    pub max_attempts: u32,
    /// Fixed sleep between attempts.
    pub backoff: Duration,
    /// Force-acquire after exhausting attempts instead of failing.
    pub force_on_exhaustion: bool,
    /// Overall budget for clean acquisition; once spent, skip to the fallback.
    pub deadline: Option<Duration>,
    /// First component of every lock token.
    pub prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(50),
            force_on_exhaustion: true,
            deadline: None,
            prefix: "lock".to_string(),
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_force_on_exhaustion(mut self, force: bool) -> Self {
        self.force_on_exhaustion = force;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_attempts".to_string(),
                value: self.max_attempts.to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "prefix".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// What to do when a condition targets an entity that is not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingEntityPolicy {
    /// Treat absence as a failed condition.
    Fail,
    /// Skip the condition and log a warning (best-effort backends).
    Skip,
}

/// Commit engine behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitConfig {
    pub missing_entity_policy: MissingEntityPolicy,
    /// Delete a membership set when its last member leaves, instead of
    /// storing an empty set.
    pub drop_empty_collections: bool,
    /// Reject assigning a unique key that the store already maps to a
    /// different entity.
    pub enforce_stored_uniqueness: bool,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            missing_entity_policy: MissingEntityPolicy::Fail,
            drop_empty_collections: true,
            enforce_stored_uniqueness: true,
        }
    }
}

impl CommitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing_entity_policy(mut self, policy: MissingEntityPolicy) -> Self {
        self.missing_entity_policy = policy;
        self
    }

    pub fn with_drop_empty_collections(mut self, drop: bool) -> Self {
        self.drop_empty_collections = drop;
        self
    }

    pub fn with_stored_uniqueness(mut self, enforce: bool) -> Self {
        self.enforce_stored_uniqueness = enforce;
        self
    }
}

/// Cache tier key layout and locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespace of integrity index entries.
    pub integrity_prefix: String,
    /// Namespace of composite query entries.
    pub query_prefix: String,
    /// Locking used by invalidation.
    pub lock: LockConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            integrity_prefix: "integrity".to_string(),
            query_prefix: "query".to_string(),
            lock: LockConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.integrity_prefix.is_empty() || self.query_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "integrity_prefix/query_prefix".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if self.integrity_prefix == self.query_prefix {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "integrity_prefix".to_string(),
                option_b: "query_prefix".to_string(),
            }
            .into());
        }
        self.lock.validate()
    }
}

/// Client pool recycling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Handles idle for longer than this are recreated on next checkout.
    pub idle_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_lifetime: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn with_idle_lifetime(mut self, lifetime: Duration) -> Self {
        self.idle_lifetime = lifetime;
        self
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.idle_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "idle_lifetime".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TesseraConfig {
    pub lock: LockConfig,
    pub commit: CommitConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
}

impl TesseraConfig {
    /// Validate every section.
    pub fn validate(&self) -> TesseraResult<()> {
        self.lock.validate()?;
        self.cache.validate()?;
        self.pool.validate()?;
        if self.lock.prefix == self.cache.integrity_prefix
            || self.lock.prefix == self.cache.query_prefix
        {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "lock.prefix".to_string(),
                option_b: "cache prefixes".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
