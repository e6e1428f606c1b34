//! Ambient tenant binding
//!
//! A [`TenantContextData`] is installed in tokio task-local storage for the
//! dynamic extent of a closure or future, so code several calls (and awaits)
//! deep can ask "which tenant, which shard" without the value being threaded
//! through every signature.
//!
//! Each `run`/`run_async` call opens its own scope. Nested scopes shadow the
//! outer binding and restore it on exit, and concurrent scopes on the same
//! runtime never observe each other's binding.
//!
//! Task-local storage does not follow `tokio::spawn`; wrap spawned futures
//! with [`TenantContext::propagate`].

use parking_lot::RwLock;
use shard_router_core::ShardResolver;
use shard_types::{ContextMetadata, ShardId, ShardKeyResult, TenantContextData, TenantId};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::{trace, warn};

use crate::error::ContextError;

tokio::task_local! {
    static CURRENT: Option<TenantContextData>;
}

static SHARED: OnceLock<RwLock<Arc<TenantContext>>> = OnceLock::new();

fn shared_slot() -> &'static RwLock<Arc<TenantContext>> {
    SHARED.get_or_init(|| RwLock::new(Arc::new(TenantContext::new())))
}

/// Opens tenant scopes, optionally resolving each tenant's shard on entry
#[derive(Default)]
pub struct TenantContext {
    resolver: RwLock<Option<Arc<dyn ShardResolver>>>,
}

impl TenantContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(resolver: Arc<dyn ShardResolver>) -> Self {
        Self {
            resolver: RwLock::new(Some(resolver)),
        }
    }

    /// Process-wide instance for call sites that are not handed one explicitly
    pub fn shared() -> Arc<TenantContext> {
        Arc::clone(&shared_slot().read())
    }

    /// Replace the process-wide instance with a fresh, unwired one
    pub fn reset_shared() -> Arc<TenantContext> {
        let fresh = Arc::new(TenantContext::new());
        *shared_slot().write() = Arc::clone(&fresh);
        fresh
    }

    /// Wire a pool manager (or any resolver) for eager shard resolution
    pub fn set_pool_manager<R: ShardResolver + 'static>(&self, manager: Arc<R>) {
        self.set_resolver(manager);
    }

    pub fn set_resolver(&self, resolver: Arc<dyn ShardResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    pub fn has_resolver(&self) -> bool {
        self.resolver.read().is_some()
    }

    /// Run `f` with `tenant_id` bound
    pub fn run<R>(&self, tenant_id: &str, f: impl FnOnce() -> R) -> R {
        self.run_with_metadata(tenant_id, ContextMetadata::default(), f)
    }

    pub fn run_with_metadata<R>(
        &self,
        tenant_id: &str,
        metadata: ContextMetadata,
        f: impl FnOnce() -> R,
    ) -> R {
        let data = self.establish(tenant_id, metadata);
        CURRENT.sync_scope(Some(data), f)
    }

    /// Run `future` with `tenant_id` bound across every await point.
    ///
    /// The shard is resolved here, when the scope is created, not when the
    /// returned future is first polled.
    pub fn run_async<F: Future>(&self, tenant_id: &str, future: F) -> impl Future<Output = F::Output> {
        self.run_async_with_metadata(tenant_id, ContextMetadata::default(), future)
    }

    pub fn run_async_with_metadata<F: Future>(
        &self,
        tenant_id: &str,
        metadata: ContextMetadata,
        future: F,
    ) -> impl Future<Output = F::Output> {
        let data = self.establish(tenant_id, metadata);
        CURRENT.scope(Some(data), future)
    }

    /// Carry the current binding (or its absence) into a future that will
    /// run on another task
    pub fn propagate<F: Future>(future: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(Self::current(), future)
    }

    /// Run `future` with no binding, even inside an outer scope
    pub fn without_context<F: Future>(future: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(None, future)
    }

    pub fn current() -> Option<TenantContextData> {
        Self::read(|data| data.clone())
    }

    pub fn is_active() -> bool {
        Self::read(|_| ()).is_some()
    }

    pub fn tenant_id() -> Option<TenantId> {
        Self::read(|data| data.tenant_id.clone())
    }

    pub fn shard_result() -> Option<ShardKeyResult> {
        Self::read(|data| data.shard_result.clone()).flatten()
    }

    pub fn shard_id() -> Option<ShardId> {
        Self::read(|data| data.shard_id().cloned()).flatten()
    }

    pub fn correlation_id() -> Option<String> {
        Self::read(|data| data.correlation_id.clone()).flatten()
    }

    pub fn metadata_value(key: &str) -> Option<String> {
        Self::read(|data| data.metadata.get(key).cloned()).flatten()
    }

    pub fn require_tenant_id() -> Result<TenantId, ContextError> {
        Self::tenant_id().ok_or(ContextError::MissingContext)
    }

    pub fn require_shard_result() -> Result<ShardKeyResult, ContextError> {
        let data = Self::current().ok_or(ContextError::MissingContext)?;
        data.shard_result.ok_or(ContextError::MissingShard {
            tenant_id: data.tenant_id,
        })
    }

    fn read<T>(f: impl FnOnce(&TenantContextData) -> T) -> Option<T> {
        CURRENT
            .try_with(|current| current.as_ref().map(f))
            .ok()
            .flatten()
    }

    fn establish(&self, tenant_id: &str, metadata: ContextMetadata) -> TenantContextData {
        let mut data = TenantContextData::with_metadata(tenant_id, metadata);

        let resolver = self.resolver.read().clone();
        if let Some(resolver) = resolver {
            match resolver.resolve_shard(tenant_id) {
                Ok(result) => {
                    trace!(tenant_id = %tenant_id, shard_id = %result.shard_id, "Tenant scope resolved");
                    data.shard_result = Some(result);
                }
                Err(err) => {
                    warn!(
                        tenant_id = %tenant_id,
                        error = %err,
                        "Shard resolution failed, tenant scope has no shard binding"
                    );
                }
            }
        }

        data
    }
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext")
            .field("has_resolver", &self.has_resolver())
            .finish()
    }
}
