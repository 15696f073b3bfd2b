//! apikeyrouter - API-key routing engine for fleets of LLM provider keys.
//!
//! Applications submit a logical request intent (model, messages,
//! parameters) and a routing objective; the engine selects one key
//! from a registered pool, dispatches the call through a provider
//! adapter, accounts for its effects (quota consumed, cost, success or
//! failure), and returns a normalized response. See `SPEC_FULL.md` for
//! the full component breakdown (C1-C8).

pub mod config;
pub mod cost;
pub mod crypto;
pub mod key_manager;
pub mod model;
pub mod observability;
pub mod provider;
pub mod quota;
pub mod router;
pub mod routing;
pub mod metrics;
pub mod store;
pub mod validation;

use thiserror::Error;

pub use config::{InMemoryStoreConfig, KeyManagerConfig, QuotaEngineConfig, RouterConfig};
pub use cost::{CostController, CostError};
pub use crypto::{CryptoError, MaterialCipher, ENCRYPTION_KEY_ENV_VAR};
pub use key_manager::{EligibilityPolicy, KeyManager, KeyManagerError};
pub use model::*;
pub use observability::{EventType, ObservabilitySink, TracingObservability};
pub use provider::{ProviderAdapter, ProviderRegistry};
pub use quota::{QuotaEngine, QuotaError};
pub use router::{Router, RouterError};
pub use routing::{PolicyDecision, RoutingEngine, RoutingError, RoutingPolicy};
pub use store::{InMemoryStateStore, StateQuery, StateStore, StateStoreError};
pub use validation::ValidationError;

/// Top-level error composing every component error, the way the
/// teacher's `AiMeshError` composes `ProtocolError`/`RoutingError`/
/// `StorageError` via `#[from]`. Not used internally by any
/// component — each keeps its own narrow error enum — but handy for
/// embedders that want one `Result` type at the call site.
#[derive(Debug, Error)]
pub enum ApiKeyRouterError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    KeyManager(#[from] KeyManagerError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Cost(#[from] CostError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
