//! Shard Router Core - tenant to shard mapping
//!
//! # Architecture
//!
//! ```text
//! tenant id
//!     │
//!     ▼
//! ┌─────────────────────────┐
//! │   murmur3_32(seed)      │  Stable 32-bit hash of the UTF-8 bytes
//! └───────────┬─────────────┘
//!             │ hash % shard count
//!             ▼
//! ┌─────────────────────────┐
//! │  ModuloHashStrategy     │  Index into lexicographically sorted shard ids
//! │  (cached per tenant)    │
//! └───────────┬─────────────┘
//!             │
//!             ▼
//!       ShardKeyResult
//! ```
//!
//! Assignment is plain modulo hashing, not a consistent-hash ring: changing
//! the shard count moves most tenants to a different shard. Callers that
//! add or remove shards must migrate tenant data accordingly.
//!
//! # Example
//!
//! ```rust,ignore
//! use shard_router_core::{ModuloHashStrategy, ShardingStrategy};
//! use shard_types::ShardInfo;
//!
//! let strategy = ModuloHashStrategy::default();
//! strategy.add_shard(ShardInfo::new("shard-0", "postgres://db0/app"));
//! strategy.add_shard(ShardInfo::new("shard-1", "postgres://db1/app"));
//!
//! if strategy.can_handle("tenant-alpha") {
//!     let result = strategy.get_shard_key("tenant-alpha");
//!     println!("{} -> {}", "tenant-alpha", result.shard_id);
//! }
//! ```

// Core modules
mod error;
pub mod hash;
mod resolver;

// Strategy module
mod strategy;

#[cfg(test)]
mod tests;

// Re-exports: Error types
pub use error::RouterError;

// Re-exports: Hashing
pub use hash::murmur3_32;

// Re-exports: Resolution seam
pub use resolver::ShardResolver;

// Re-exports: Strategy trait and implementation
pub use strategy::{ModuloHashStrategy, ShardingStrategy};
