//! Shared data model for tenant shard routing.
//!
//! These types cross every crate boundary in the workspace: the sharding
//! strategy produces [`ShardKeyResult`]s, the pool manager reports
//! [`ShardStatus`] snapshots, and the tenant context carries
//! [`TenantContextData`] through a unit of work.

// ========== Shard model ==========
pub mod shard;

// ========== Ambient tenant binding ==========
pub mod context;

pub use shard::{ShardHealth, ShardId, ShardInfo, ShardKeyResult, ShardStatus};
pub use context::{ContextMetadata, TenantContextData, TenantId};
