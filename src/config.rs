//! Configuration structs recognized by the core (spec §6 "Configuration
//! options"). Plain structs with `Default` impls, one per component,
//! the way the teacher splits `RouterConfig`/`RateLimitConfig`/
//! `StorageConfig` out from its top-level `AiMeshConfig` rather than
//! using one monolithic options bag. No file/env loader lives here —
//! that is the embedder's job (spec §1 lists "the top-level
//! configuration loader" as an external collaborator); these structs
//! are what such a loader would populate.

#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Default `cooldown_seconds` applied to a `Throttled` transition
    /// when the caller does not supply one explicitly.
    pub default_cooldown_seconds: i64,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            default_cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaEngineConfig {
    /// Cooldown applied when a 429 response carries no parseable
    /// `Retry-After` header.
    pub default_cooldown_seconds: i64,
    /// TTL for cached `ExhaustionPrediction`s before `predict_exhaustion`
    /// recomputes them.
    pub prediction_cache_ttl_seconds: i64,
}

impl Default for QuotaEngineConfig {
    fn default() -> Self {
        Self {
            default_cooldown_seconds: 60,
            prediction_cache_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub key_manager: KeyManagerConfig,
    pub quota_engine: QuotaEngineConfig,
    /// Recognized but not enforced here: the embedder's `tracing-subscriber`
    /// filter is what actually gates log output (spec §6 `log_level`);
    /// this field exists so a config loader has somewhere to put the value.
    pub log_level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            key_manager: KeyManagerConfig::default(),
            quota_engine: QuotaEngineConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Bounds for the in-memory `StateStore`'s append-only ring buffers
/// (spec §6 `max_decisions`/`max_transitions`).
#[derive(Debug, Clone, Copy)]
pub struct InMemoryStoreConfig {
    pub max_transitions: usize,
    pub max_decisions: usize,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_transitions: 10_000,
            max_decisions: 10_000,
        }
    }
}
