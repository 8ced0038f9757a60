//! Query cache tier.
//!
//! - `query`: query parameters, composite keys, in-memory finishing
//! - `stats`: hit/miss/invalidation counters
//! - `tier`: lookups, result storage and integrity-tracked invalidation

mod query;
mod stats;
mod tier;

pub use query::{
    finish, namespace_of, project, select, CacheLevel, QueryBase, QueryParams, SortDirection,
};
pub use stats::CacheStats;
pub use tier::{CacheTier, FillTicket, InvalidationReport};
