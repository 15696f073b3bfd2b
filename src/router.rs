//! Router facade (C8): composes the components and exposes the
//! minimal public API (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::cost::{CostController, CostError};
use crate::key_manager::{KeyManager, KeyManagerError};
use crate::model::{
    ApiKey, CorrelationId, ErrorCategory, KeyState, Metadata, ProviderId, RequestIntent, RoutingObjective,
    SystemResponse,
};
use crate::observability::{EventType, ObservabilitySink, TracingObservability};
use crate::provider::{ProviderAdapter, ProviderRegistry};
use crate::quota::QuotaEngine;
use crate::routing::{RoutingEngine, RoutingError};
use crate::store::{InMemoryStateStore, StateStore, StateStoreError};

const MAX_ROUTE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("provider already registered: {0}")]
    ProviderAlreadyRegistered(String),
    #[error("provider not registered: {0}")]
    ProviderNotRegistered(String),
    #[error(transparent)]
    KeyManager(#[from] KeyManagerError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Cost(#[from] CostError),
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error("request exhausted retry budget after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: usize, message: String },
}

/// Composition root. Owns the provider registry and wires the other
/// components together, exposing only `register_provider`,
/// `register_key`, and `route` plus accessors for advanced use.
pub struct Router {
    providers: Arc<ProviderRegistry>,
    key_manager: Arc<KeyManager>,
    quota_engine: Arc<QuotaEngine>,
    cost_controller: Arc<CostController>,
    routing_engine: Arc<RoutingEngine>,
    observability: Arc<dyn ObservabilitySink>,
}

impl Router {
    pub fn new(store: Arc<dyn StateStore>, observability: Arc<dyn ObservabilitySink>, cipher: Arc<crate::crypto::MaterialCipher>, config: RouterConfig) -> Self {
        let providers: Arc<ProviderRegistry> = Arc::new(ProviderRegistry::new());

        let key_manager = Arc::new(KeyManager::new(store.clone(), observability.clone(), cipher, config.key_manager));
        let quota_engine = Arc::new(
            QuotaEngine::new(store.clone(), observability.clone(), config.quota_engine).with_key_manager_hook(key_manager.clone()),
        );
        let cost_controller = Arc::new(CostController::new(store.clone(), observability.clone(), providers.clone()));
        let routing_engine = Arc::new(RoutingEngine::new(
            key_manager.clone(),
            Some(quota_engine.clone()),
            Some(cost_controller.clone()),
            store,
            observability.clone(),
        ));

        Self {
            providers,
            key_manager,
            quota_engine,
            cost_controller,
            routing_engine,
            observability,
        }
    }

    /// Convenience constructor wiring an in-memory store and a
    /// `tracing`-backed observability sink, mirroring the teacher's
    /// all-defaults entry point for local runs and tests.
    pub fn in_memory(cipher: Arc<crate::crypto::MaterialCipher>) -> Self {
        Self::new(
            Arc::new(InMemoryStateStore::default()),
            Arc::new(TracingObservability::new()),
            cipher,
            RouterConfig::default(),
        )
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    pub fn quota_engine(&self) -> &Arc<QuotaEngine> {
        &self.quota_engine
    }

    pub fn cost_controller(&self) -> &Arc<CostController> {
        &self.cost_controller
    }

    pub fn routing_engine(&self) -> &Arc<RoutingEngine> {
        &self.routing_engine
    }

    pub async fn register_provider(
        &self,
        provider_id: &str,
        adapter: Arc<dyn ProviderAdapter>,
        overwrite: bool,
    ) -> Result<(), RouterError> {
        let trimmed = provider_id.trim();
        let key = ProviderId::from(trimmed);

        if !overwrite && self.providers.contains_key(&key) {
            return Err(RouterError::ProviderAlreadyRegistered(trimmed.to_string()));
        }

        self.providers.insert(key.clone(), adapter);

        self.observability
            .emit_event(EventType::ProviderRegistered, serde_json::json!({"provider_id": key.as_str()}), None)
            .await;

        Ok(())
    }

    pub async fn register_key(&self, material: &str, provider_id: &str, metadata: Option<Metadata>) -> Result<ApiKey, RouterError> {
        let key = ProviderId::from(provider_id.trim());
        if !self.providers.contains_key(&key) {
            return Err(RouterError::ProviderNotRegistered(provider_id.trim().to_string()));
        }

        let registered = self.key_manager.register_key(material, provider_id.trim(), metadata).await?;
        self.quota_engine.get_quota_state(&registered.id).await.map_err(|e| {
            warn!(error = %e, "failed to initialize quota state for newly registered key");
            RouterError::Store(StateStoreError::Backend(e.to_string()))
        })?;

        Ok(registered)
    }

    /// Routes a request to the best available key, retrying on
    /// retryable adapter failures up to a bounded attempt count.
    pub async fn route(&self, intent: RequestIntent, objective: Option<RoutingObjective>) -> Result<SystemResponse, RouterError> {
        let request_id = intent.request_id.clone().unwrap_or_else(crate::model::RequestId::new);
        let correlation_id = CorrelationId::new();
        let mut intent = intent;
        intent.request_id = Some(request_id.clone());

        info!(request_id = %request_id, correlation_id = %correlation_id, "request_routing_started");

        let mut last_error: Option<String> = None;

        for attempt in 0..MAX_ROUTE_ATTEMPTS {
            let decision = match self.routing_engine.route_request(&intent, objective.clone()).await {
                Ok(d) => d,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "routing failed");
                    return Err(e.into());
                }
            };

            let key = self
                .key_manager
                .get_key(&decision.selected_key_id)
                .await?
                .ok_or_else(|| RouterError::KeyManager(KeyManagerError::KeyNotFound(decision.selected_key_id.to_string())))?;

            let adapter = self
                .providers
                .get(&decision.selected_provider_id)
                .ok_or_else(|| RouterError::ProviderNotRegistered(decision.selected_provider_id.to_string()))?
                .clone();

            if let Some(estimate) = decision
                .evaluation_results
                .get(&decision.selected_key_id)
                .and_then(|eval| eval.cost_estimate)
            {
                self.cost_controller
                    .record_estimated_cost(
                        &request_id,
                        estimate,
                        Some(decision.selected_provider_id.clone()),
                        Some(intent.model.clone()),
                        Some(decision.selected_key_id.clone()),
                    )
                    .await;
            }

            match adapter.execute_request(&intent, &key).await {
                Ok(response) => {
                    self.account_for_success(&decision.selected_key_id, &response, &request_id).await;

                    let mut response = response;
                    response.metadata.insert("correlation_id".to_string(), serde_json::json!(correlation_id.as_str()));

                    self.observability
                        .emit_event(
                            EventType::RequestCompleted,
                            serde_json::json!({"request_id": request_id.as_str(), "key_id": decision.selected_key_id.as_str()}),
                            None,
                        )
                        .await;

                    return Ok(response);
                }
                Err(domain_error) => {
                    self.observability
                        .emit_event(
                            EventType::RequestFailed,
                            serde_json::json!({
                                "request_id": request_id.as_str(),
                                "key_id": decision.selected_key_id.as_str(),
                                "category": format!("{:?}", domain_error.category),
                                "retryable": domain_error.retryable,
                            }),
                            None,
                        )
                        .await;

                    if !domain_error.retryable || attempt + 1 == MAX_ROUTE_ATTEMPTS {
                        return Err(RouterError::RetriesExhausted {
                            attempts: attempt + 1,
                            message: domain_error.message,
                        });
                    }

                    if domain_error.category == ErrorCategory::RateLimit {
                        let mut headers = HashMap::new();
                        headers.insert("Retry-After".to_string(), self.quota_engine.default_cooldown_seconds().to_string());
                        if let Err(e) = self
                            .quota_engine
                            .handle_quota_response(&decision.selected_key_id, 429, &headers, Some(&decision.selected_provider_id))
                            .await
                        {
                            warn!(error = %e, "failed to record 429 on retry path");
                        }
                    } else if domain_error.category == ErrorCategory::ProviderUnavailable {
                        if let Err(e) = self
                            .key_manager
                            .update_key_state(&decision.selected_key_id, KeyState::Throttled, "provider_unavailable", None, None)
                            .await
                        {
                            warn!(error = %e, "failed to throttle key after provider-unavailable error");
                        }
                    }

                    last_error = Some(domain_error.message);
                }
            }
        }

        Err(RouterError::RetriesExhausted {
            attempts: MAX_ROUTE_ATTEMPTS,
            message: last_error.unwrap_or_else(|| "unknown failure".to_string()),
        })
    }

    async fn account_for_success(&self, key_id: &crate::model::KeyId, response: &SystemResponse, request_id: &crate::model::RequestId) {
        if let Err(e) = self.key_manager.record_usage(key_id).await {
            warn!(error = %e, "failed to persist usage accounting");
        }

        let tokens_consumed = response.token_usage.map(|u| u.total() as f64);
        if let Err(e) = self.quota_engine.update_capacity(key_id, 1.0, tokens_consumed).await {
            warn!(error = %e, "failed to decrement quota capacity after success");
        }

        if let Some(actual_cost) = response.actual_cost {
            self.cost_controller.record_actual_cost(request_id, actual_cost).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MaterialCipher;
    use crate::model::{Currency, DomainError, EstimationMethod, Message, ProviderCapabilities, ProviderHealth, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        async fn execute_request(&self, intent: &RequestIntent, key: &ApiKey) -> Result<SystemResponse, DomainError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(DomainError {
                    category: ErrorCategory::RateLimit,
                    message: "rate limited".to_string(),
                    retryable: true,
                });
            }
            Ok(SystemResponse {
                request_id: intent.request_id.clone().unwrap(),
                key_used: key.id.clone(),
                provider_id: intent.provider_id.clone(),
                content: "ok".to_string(),
                token_usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                actual_cost: None,
                metadata: HashMap::new(),
            })
        }

        fn normalize_response(&self, _raw: serde_json::Value) -> Result<SystemResponse, DomainError> {
            unimplemented!()
        }

        fn map_error(&self, _raw: &dyn std::error::Error) -> DomainError {
            unimplemented!()
        }

        fn get_capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                supports_streaming: false,
                supports_tools: false,
                supports_images: false,
                max_tokens: None,
                rate_limit_per_minute: None,
                custom: HashMap::new(),
            }
        }

        async fn estimate_cost(&self, _intent: &RequestIntent) -> Result<crate::model::CostEstimate, DomainError> {
            Ok(crate::model::CostEstimate {
                amount: rust_decimal::Decimal::new(1, 2),
                currency: Currency::Usd,
                confidence: 0.9,
                estimation_method: EstimationMethod::Heuristic,
                input_tokens_estimate: 10,
                output_tokens_estimate: 5,
            })
        }

        async fn get_health(&self) -> ProviderHealth {
            ProviderHealth {
                status: crate::model::HealthStatus::Healthy,
                last_check: chrono::Utc::now(),
            }
        }
    }

    fn router() -> Router {
        Router::in_memory(Arc::new(MaterialCipher::generate_for_tests()))
    }

    #[tokio::test]
    async fn register_provider_rejects_duplicates() {
        let router = router();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0) });
        router.register_provider("openai", adapter.clone(), false).await.unwrap();
        let result = router.register_provider("openai", adapter, false).await;
        assert!(matches!(result, Err(RouterError::ProviderAlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn register_key_requires_registered_provider() {
        let router = router();
        let result = router.register_key("sk-aaaaaaaaaaaaaaaa", "openai", None).await;
        assert!(matches!(result, Err(RouterError::ProviderNotRegistered(_))));
    }

    #[tokio::test]
    async fn route_retries_on_retryable_failure_then_succeeds() {
        let router = router();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(FlakyAdapter { calls: AtomicUsize::new(0) });
        router.register_provider("openai", adapter, false).await.unwrap();
        let key = router.register_key("sk-aaaaaaaaaaaaaaaa", "openai", None).await.unwrap();

        let intent = RequestIntent {
            provider_id: ProviderId::from("openai"),
            request_id: None,
            model: "gpt-4".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            max_tokens: None,
            temperature: None,
            metadata: Default::default(),
        };

        let response = router.route(intent, Some(RoutingObjective::single(crate::model::ObjectiveType::Reliability))).await.unwrap();
        assert_eq!(response.key_used, key.id);
    }
}
