//! Tenant binding carried through a unit of work

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::shard::{ShardId, ShardKeyResult};

/// Tenant identifier
pub type TenantId = String;

/// Optional data attached when a tenant scope is opened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub correlation_id: Option<String>,
    pub values: HashMap<String, String>,
}

impl ContextMetadata {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// The value visible to everything running inside a tenant scope.
///
/// Lives only for the dynamic extent of the scope; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContextData {
    pub tenant_id: TenantId,

    /// Shard binding, present when a resolver was wired and resolution succeeded
    pub shard_result: Option<ShardKeyResult>,

    pub correlation_id: Option<String>,

    pub metadata: HashMap<String, String>,
}

impl TenantContextData {
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            shard_result: None,
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Build from opening metadata
    pub fn with_metadata(tenant_id: impl Into<TenantId>, metadata: ContextMetadata) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            shard_result: None,
            correlation_id: metadata.correlation_id,
            metadata: metadata.values,
        }
    }

    pub fn shard_id(&self) -> Option<&ShardId> {
        self.shard_result.as_ref().map(|r| &r.shard_id)
    }
}
