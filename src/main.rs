//! apikeyrouter demo binary: wires an in-memory store, registers two
//! toy provider adapters and a handful of keys, then routes a single
//! request under each of the three built-in objectives. Mirrors the
//! teacher's `main.rs` shape (tracing subscriber, register some
//! endpoints/keys, process one message, print stats) but against this
//! crate's `Router` facade instead of `AiMesh`.

use std::collections::HashMap;
use std::sync::Arc;

use apikeyrouter::{
    ApiKey, CostEstimate, Currency, DomainError, EstimationMethod, Message, MaterialCipher, ProviderAdapter,
    ProviderCapabilities, ProviderHealth, RequestIntent, Router, RoutingObjective, SystemResponse,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// A toy adapter that always succeeds, billing a flat per-request cost
/// that varies by model name so the cost-objective demo has something
/// to differentiate on.
struct DemoAdapter {
    cost_per_request: Decimal,
}

#[async_trait]
impl ProviderAdapter for DemoAdapter {
    async fn execute_request(&self, intent: &RequestIntent, key: &ApiKey) -> Result<SystemResponse, DomainError> {
        Ok(SystemResponse {
            request_id: intent.request_id.clone().unwrap_or_default(),
            key_used: key.id.clone(),
            provider_id: intent.provider_id.clone(),
            content: format!("demo response from model {}", intent.model),
            token_usage: Some(apikeyrouter::TokenUsage {
                input_tokens: 32,
                output_tokens: 64,
            }),
            actual_cost: Some(self.cost_per_request),
            metadata: HashMap::new(),
        })
    }

    fn normalize_response(&self, _raw: serde_json::Value) -> Result<SystemResponse, DomainError> {
        unimplemented!("demo adapter returns normalized responses directly from execute_request")
    }

    fn map_error(&self, _raw: &dyn std::error::Error) -> DomainError {
        unimplemented!("demo adapter never produces a provider-native error to map")
    }

    fn get_capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_streaming: false,
            supports_tools: false,
            supports_images: false,
            max_tokens: Some(4096),
            rate_limit_per_minute: None,
            custom: HashMap::new(),
        }
    }

    async fn estimate_cost(&self, _intent: &RequestIntent) -> Result<CostEstimate, DomainError> {
        Ok(CostEstimate {
            amount: self.cost_per_request,
            currency: Currency::Usd,
            confidence: 0.9,
            estimation_method: EstimationMethod::Heuristic,
            input_tokens_estimate: 32,
            output_tokens_estimate: 64,
        })
    }

    async fn get_health(&self) -> ProviderHealth {
        ProviderHealth {
            status: apikeyrouter::HealthStatus::Healthy,
            last_check: chrono::Utc::now(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting apikeyrouter v{}", env!("CARGO_PKG_VERSION"));

    let cipher = Arc::new(MaterialCipher::generate_for_tests());
    let router = Router::in_memory(cipher);

    router
        .register_provider("openai", Arc::new(DemoAdapter { cost_per_request: Decimal::new(2, 2) }), false)
        .await?;
    router
        .register_provider(
            "anthropic",
            Arc::new(DemoAdapter { cost_per_request: Decimal::new(1, 2) }),
            false,
        )
        .await?;

    let k1 = router.register_key("sk-openai-demo-key-one", "openai", None).await?;
    let k2 = router.register_key("sk-openai-demo-key-two", "openai", None).await?;
    let k3 = router.register_key("sk-anthropic-demo-key-one", "anthropic", None).await?;

    info!(keys = 3, k1 = %k1.id, k2 = %k2.id, k3 = %k3.id, "registered demo keys");

    let intent = RequestIntent {
        provider_id: "openai".into(),
        request_id: None,
        model: "gpt-4".to_string(),
        messages: vec![Message {
            role: "user".to_string(),
            content: "hello, route me to the best key".to_string(),
        }],
        max_tokens: Some(256),
        temperature: Some(0.7),
        metadata: HashMap::new(),
    };

    for objective in [
        RoutingObjective::single(apikeyrouter::ObjectiveType::Fairness),
        RoutingObjective::single(apikeyrouter::ObjectiveType::Cost),
        RoutingObjective::single(apikeyrouter::ObjectiveType::Reliability),
    ] {
        let primary = objective.primary;
        match router.route(intent.clone(), Some(objective)).await {
            Ok(response) => {
                info!(
                    objective = ?primary,
                    key_used = %response.key_used,
                    content = %response.content,
                    "routed request"
                );
            }
            Err(e) => {
                info!(objective = ?primary, error = %e, "routing failed");
            }
        }
    }

    Ok(())
}
