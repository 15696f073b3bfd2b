//! Provider Adapter (C3): per-vendor capability consumed by the core.
//! Out of scope per spec §1 ("the provider-adapter implementations
//! themselves"); this module defines only the trait the core calls
//! through, following the teacher's pattern of a narrow trait boundary
//! (`StorageLayer` wraps `BarqDbClient`/`BarqGraphClient` behind a
//! concrete struct; here the boundary is abstract because providers
//! are genuinely pluggable).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{
    ApiKey, CostEstimate, DomainError, ProviderCapabilities, ProviderHealth, ProviderId, RequestIntent, SystemResponse,
};

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn execute_request(&self, intent: &RequestIntent, key: &ApiKey) -> Result<SystemResponse, DomainError>;

    fn normalize_response(&self, raw: serde_json::Value) -> Result<SystemResponse, DomainError>;

    fn map_error(&self, raw: &dyn std::error::Error) -> DomainError;

    fn get_capabilities(&self) -> ProviderCapabilities;

    async fn estimate_cost(&self, intent: &RequestIntent) -> Result<CostEstimate, DomainError>;

    async fn get_health(&self) -> ProviderHealth;
}

/// Shared registry of provider adapters, keyed by `ProviderId`. Owned by
/// the router facade (C8) and handed to the cost controller and routing
/// engine so both can resolve a provider without knowing about each
/// other, the way the teacher's `Router` hands its `StorageLayer`
/// handle to each subsystem rather than letting them construct one.
pub type ProviderRegistry = DashMap<ProviderId, Arc<dyn ProviderAdapter>>;
