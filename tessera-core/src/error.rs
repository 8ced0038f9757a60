//! Error types for Tessera operations

use crate::key::Key;
use thiserror::Error;

/// Key construction and normalization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key component for {field}: {kind} values cannot be part of a key")]
    InvalidComponent { field: String, kind: &'static str },

    #[error("Key template '{template}' has no parts")]
    EmptyTemplate { template: String },

    #[error("Key template '{template}' expanded to {count} keys, expected exactly one")]
    NotSingular { template: String, count: usize },

    #[error("Field not found on entity: {field}")]
    MissingField { field: String },

    #[error("Malformed encoded key: {encoded}")]
    Malformed { encoded: String },
}

/// Predicate construction and evaluation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unresolvable attribute path {path}: {reason}")]
    UnresolvablePath { path: String, reason: String },

    #[error("Malformed quantifier: expected exactly one of any/all/none, got {keys:?}")]
    MalformedQuantifier { keys: Vec<String> },

    #[error("Comparison '{op}' needs at least two operands, got {got}")]
    OperandArity { op: String, got: usize },

    #[error("Malformed predicate: {reason}")]
    MalformedPredicate { reason: String },
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backend operation {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Deserialization failed for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all Tessera errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Condition not met for {key}: {reason}")]
    ConditionFailed { key: String, reason: String },

    #[error("Corruption: {reason}")]
    Corruption { reason: String },

    #[error("Unsupported by {backend}: {capability}")]
    Unsupported { backend: String, capability: String },

    #[error("Locks still contended after {attempts} attempts: {tokens:?}")]
    LockContended { attempts: u32, tokens: Vec<String> },

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// Build a `NotFound` for a key.
    pub fn not_found(key: &Key) -> Self {
        TesseraError::NotFound {
            key: key.to_string(),
        }
    }

    /// Build a `Corruption` error.
    pub fn corruption(reason: impl Into<String>) -> Self {
        TesseraError::Corruption {
            reason: reason.into(),
        }
    }

    /// Build an `Unsupported` error.
    pub fn unsupported(backend: impl Into<String>, capability: impl Into<String>) -> Self {
        TesseraError::Unsupported {
            backend: backend.into(),
            capability: capability.into(),
        }
    }

    /// Whether this error is a plain miss that callers usually recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TesseraError::NotFound { .. })
    }
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================
