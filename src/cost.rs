//! Cost Controller (C6): converts request intents to expected cost,
//! polices budgets, and reconciles estimates with observed spend
//! (spec §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, warn};

use crate::model::{
    Budget, BudgetCheckResult, BudgetId, BudgetScope, CostEstimate, CostReconciliation, EnforcementMode, KeyId,
    ProviderId, RequestId, RequestIntent, TimeWindow,
};
use crate::observability::{EventType, ObservabilitySink};
use crate::provider::ProviderRegistry;
use crate::store::{StateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum CostError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("{message}")]
    BudgetExceeded {
        message: String,
        remaining_budget: Decimal,
        violated_budget_ids: Vec<BudgetId>,
        requested_amount: Decimal,
        budget_limit: Decimal,
    },
    #[error("provider estimate failed: {0}")]
    EstimationFailed(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// Default cheaper-model fallback table, seeded into every
/// `CostController` unless overridden via `with_downgrade_map`. Mirrors
/// the original implementation's small hardcoded table; a real
/// deployment would source this from provider metadata.
static DOWNGRADE_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4", "gpt-3.5-turbo"),
        ("gpt-4-turbo", "gpt-3.5-turbo"),
        ("gpt-4o", "gpt-4o-mini"),
        ("claude-3-opus", "claude-3-haiku"),
        ("claude-3-sonnet", "claude-3-haiku"),
    ])
});

struct CachedEstimate {
    estimate: CostEstimate,
    provider_id: Option<ProviderId>,
    model: Option<String>,
    key_id: Option<KeyId>,
}

pub struct CostController {
    store: Arc<dyn StateStore>,
    observability: Arc<dyn ObservabilitySink>,
    providers: Arc<ProviderRegistry>,
    estimate_cache: DashMap<String, CachedEstimate>,
    budgets: RwLock<Vec<BudgetId>>,
    downgrade_map: RwLock<HashMap<String, String>>,
}

impl CostController {
    pub fn new(store: Arc<dyn StateStore>, observability: Arc<dyn ObservabilitySink>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            observability,
            providers,
            estimate_cache: DashMap::new(),
            budgets: RwLock::new(Vec::new()),
            downgrade_map: RwLock::new(DOWNGRADE_MAP.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        }
    }

    /// Replaces the cheaper-model downgrade table used by
    /// `enforce_budget`. Callers with a different provider lineup than
    /// the built-in default can supply their own mapping.
    pub fn with_downgrade_map(self, map: HashMap<String, String>) -> Self {
        *self.downgrade_map.write() = map;
        self
    }

    pub async fn estimate_request_cost(
        &self,
        intent: &RequestIntent,
        provider_id: &ProviderId,
        _key_id: Option<&KeyId>,
    ) -> Result<CostEstimate, CostError> {
        let adapter = self
            .providers
            .get(provider_id)
            .ok_or_else(|| CostError::UnknownProvider(provider_id.to_string()))?;

        let estimate = adapter.estimate_cost(intent).await.map_err(|e| {
            error!(provider_id = %provider_id, error = %e, "cost estimation failed");
            CostError::EstimationFailed(e.to_string())
        })?;

        self.observability
            .emit_event(
                EventType::CostEstimated,
                serde_json::json!({"provider_id": provider_id.as_str(), "amount": estimate.amount.to_string()}),
                None,
            )
            .await;

        Ok(estimate)
    }

    pub async fn create_budget(
        &self,
        scope: BudgetScope,
        limit: Decimal,
        period: TimeWindow,
        scope_id: Option<String>,
        enforcement_mode: EnforcementMode,
    ) -> Result<Budget, CostError> {
        if scope != BudgetScope::Global && scope_id.is_none() {
            return Err(CostError::Validation(format!(
                "scope_id is required for budget scope {:?}",
                scope
            )));
        }

        let now = Utc::now();
        let budget = Budget {
            id: BudgetId::new(),
            scope,
            scope_id,
            limit_amount: limit,
            current_spend: Decimal::ZERO,
            period,
            enforcement_mode,
            reset_at: next_reset(period, now),
            created_at: now,
            warning_count: 0,
        };

        self.store.save_budget(&budget).await?;
        self.budgets.write().push(budget.id.clone());

        self.observability
            .emit_event(
                EventType::BudgetCreated,
                serde_json::json!({"budget_id": budget.id.as_str(), "scope": format!("{:?}", scope), "limit": limit.to_string()}),
                None,
            )
            .await;

        Ok(budget)
    }

    pub async fn update_spending(&self, budget_id: &BudgetId, amount: Decimal) -> Result<Budget, CostError> {
        if amount < Decimal::ZERO {
            return Err(CostError::Validation("spending amount must be non-negative".to_string()));
        }

        let mut budget = self
            .store
            .get_budget(budget_id)
            .await?
            .ok_or_else(|| CostError::Validation(format!("budget not found: {budget_id}")))?;

        let now = Utc::now();
        if now >= budget.reset_at {
            budget.current_spend = Decimal::ZERO;
            budget.warning_count = 0;
            budget.reset_at = next_reset(budget.period, now);
        }

        budget.current_spend += amount;
        self.store.save_budget(&budget).await?;

        self.observability
            .emit_event(
                EventType::BudgetSpendingUpdated,
                serde_json::json!({"budget_id": budget_id.as_str(), "current_spend": budget.current_spend.to_string()}),
                None,
            )
            .await;

        if budget.is_exceeded() {
            warn!(budget_id = %budget_id, current_spend = %budget.current_spend, limit = %budget.limit_amount, "budget exceeded");
        }

        Ok(budget)
    }

    async fn applicable_budgets(&self, provider_id: Option<&ProviderId>, key_id: Option<&KeyId>) -> Result<Vec<Budget>, CostError> {
        let all = self.store.list_budgets().await?;
        let mut applicable = Vec::new();
        for b in all {
            let matches = match b.scope {
                BudgetScope::Global => true,
                BudgetScope::PerProvider => provider_id.map(|p| b.scope_id.as_deref() == Some(p.as_str())).unwrap_or(false),
                BudgetScope::PerKey => key_id.map(|k| b.scope_id.as_deref() == Some(k.as_str())).unwrap_or(false),
                BudgetScope::PerRoute => false,
            };
            if matches {
                applicable.push(b);
            }
        }
        Ok(applicable)
    }

    pub async fn check_budget(
        &self,
        _intent: &RequestIntent,
        cost_estimate: &CostEstimate,
        provider_id: Option<&ProviderId>,
        key_id: Option<&KeyId>,
    ) -> Result<BudgetCheckResult, CostError> {
        let applicable = self.applicable_budgets(provider_id, key_id).await?;
        if applicable.is_empty() {
            return Ok(BudgetCheckResult::allowed_unbounded());
        }

        let mut violated = Vec::new();
        let mut soft_violated = Vec::new();
        let mut min_remaining: Option<Decimal> = None;

        for mut budget in applicable {
            let now = Utc::now();
            if now >= budget.reset_at {
                budget.current_spend = Decimal::ZERO;
                budget.warning_count = 0;
                budget.reset_at = next_reset(budget.period, now);
                self.store.save_budget(&budget).await?;
            }

            let remaining_before = budget.remaining_budget();
            min_remaining = Some(min_remaining.map(|m| m.min(remaining_before)).unwrap_or(remaining_before));

            let remaining_after = remaining_before - cost_estimate.amount;
            if remaining_after < Decimal::ZERO {
                match budget.enforcement_mode {
                    EnforcementMode::Hard => violated.push(budget.id.clone()),
                    EnforcementMode::Soft => soft_violated.push(budget.id.clone()),
                }
            }
        }

        let allowed = violated.is_empty() && soft_violated.is_empty();
        let result = BudgetCheckResult {
            allowed,
            remaining_budget: min_remaining.unwrap_or(Decimal::ZERO),
            violated_budgets: violated,
            soft_violated_budgets: soft_violated,
        };

        self.observability
            .emit_event(
                EventType::BudgetChecked,
                serde_json::json!({"allowed": result.allowed, "remaining_budget": result.remaining_budget.to_string()}),
                None,
            )
            .await;

        if !result.allowed {
            warn!(
                violated = result.violated_budgets.len(),
                soft_violated = result.soft_violated_budgets.len(),
                "budget check found violations"
            );
        }

        Ok(result)
    }

    /// Enforces budgets, optionally downgrading the request's model to
    /// a cheaper variant before giving up when only soft budgets are
    /// violated.
    pub async fn enforce_budget(
        &self,
        intent: &mut RequestIntent,
        estimate: &CostEstimate,
        provider_id: Option<&ProviderId>,
        key_id: Option<&KeyId>,
        enable_downgrade: bool,
    ) -> Result<BudgetCheckResult, CostError> {
        let result = self.check_budget(intent, estimate, provider_id, key_id).await?;
        if result.allowed {
            return Ok(result);
        }

        if !result.violated_budgets.is_empty() {
            let hard_budget = self.store.get_budget(&result.violated_budgets[0]).await?;
            let limit = hard_budget.map(|b| b.limit_amount).unwrap_or(Decimal::ZERO);

            self.observability
                .emit_event(
                    EventType::BudgetViolation,
                    serde_json::json!({
                        "violated_budgets": result.violated_budgets.iter().map(|b| b.as_str()).collect::<Vec<_>>(),
                        "requested_amount": estimate.amount.to_string(),
                    }),
                    None,
                )
                .await;
            error!(violated = ?result.violated_budgets, "hard budget exceeded");

            return Err(CostError::BudgetExceeded {
                message: "hard budget limit exceeded".to_string(),
                remaining_budget: result.remaining_budget,
                violated_budget_ids: result.violated_budgets,
                requested_amount: estimate.amount,
                budget_limit: limit,
            });
        }

        let mut downgrade_attempted = false;
        let mut downgrade_successful = false;
        let original_model = intent.model.clone();
        let mut downgrade_model: Option<String> = None;
        let mut downgrade_cost: Option<Decimal> = None;

        if enable_downgrade {
            let cheaper = self.downgrade_map.read().get(intent.model.as_str()).cloned();
            if let Some(cheaper) = cheaper {
                downgrade_attempted = true;
                intent.model = cheaper.clone();
                downgrade_model = Some(cheaper);

                if let Some(provider_id) = provider_id {
                    match self.estimate_request_cost(intent, provider_id, key_id).await {
                        Ok(new_estimate) => {
                            downgrade_successful = true;
                            downgrade_cost = Some(new_estimate.amount);
                        }
                        Err(e) => {
                            warn!(error = %e, "downgrade re-estimate failed, reverting model");
                            intent.model = original_model.clone();
                        }
                    }
                } else {
                    intent.model = original_model.clone();
                }
            }
        }

        for budget_id in &result.soft_violated_budgets {
            if let Some(mut budget) = self.store.get_budget(budget_id).await? {
                budget.warning_count += 1;
                self.store.save_budget(&budget).await?;

                self.observability
                    .emit_event(
                        EventType::BudgetWarning,
                        serde_json::json!({
                            "budget_id": budget_id.as_str(),
                            "warning_count": budget.warning_count,
                            "downgrade_attempted": downgrade_attempted,
                            "downgrade_successful": downgrade_successful,
                            "original_model": original_model,
                            "downgrade_model": downgrade_model,
                            "downgrade_cost": downgrade_cost.map(|c| c.to_string()),
                        }),
                        None,
                    )
                    .await;
                warn!(budget_id = %budget_id, warning_count = budget.warning_count, "soft budget violated");
            }
        }

        Ok(result)
    }

    pub async fn record_estimated_cost(
        &self,
        request_id: &RequestId,
        estimate: CostEstimate,
        provider_id: Option<ProviderId>,
        model: Option<String>,
        key_id: Option<KeyId>,
    ) {
        self.estimate_cache.insert(
            request_id.to_string(),
            CachedEstimate {
                estimate,
                provider_id,
                model,
                key_id,
            },
        );
        self.observability
            .emit_event(EventType::CostEstimateRecorded, serde_json::json!({"request_id": request_id.as_str()}), None)
            .await;
    }

    pub async fn record_actual_cost(&self, request_id: &RequestId, actual: Decimal) -> Option<CostReconciliation> {
        let cached = match self.estimate_cache.remove(request_id.as_str()) {
            Some((_, cached)) => cached,
            None => {
                warn!(request_id = %request_id, "no cached estimate for reconciliation, skipping");
                return None;
            }
        };

        let estimated = cached.estimate.amount;
        let error_amount = actual - estimated;
        let error_percentage = if estimated.is_zero() && actual.is_zero() {
            Decimal::ZERO
        } else if estimated.is_zero() {
            Decimal::ONE_HUNDRED
        } else {
            (actual - estimated) / estimated * Decimal::ONE_HUNDRED
        };

        let reconciliation = CostReconciliation {
            request_id: request_id.clone(),
            estimated_cost: estimated,
            actual_cost: actual,
            error_amount,
            error_percentage,
            provider_id: cached.provider_id,
            model: cached.model,
            key_id: cached.key_id,
            reconciled_at: Utc::now(),
        };

        if let Err(e) = self.store.save_reconciliation(&reconciliation).await {
            warn!(error = %e, "failed to persist cost reconciliation, continuing");
        }

        self.observability
            .emit_event(
                EventType::CostReconciled,
                serde_json::json!({"request_id": request_id.as_str(), "error_percentage": error_percentage.to_string()}),
                None,
            )
            .await;

        if error_percentage.abs() > Decimal::TEN {
            self.observability
                .emit_event(
                    EventType::CostModelAnalysis,
                    serde_json::json!({"request_id": request_id.as_str(), "error_percentage": error_percentage.to_string()}),
                    None,
                )
                .await;
            warn!(request_id = %request_id, error_percentage = %error_percentage, "cost model drift beyond 10%");
        }

        Some(reconciliation)
    }
}

fn next_reset(period: TimeWindow, from: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        TimeWindow::Hourly => {
            let next_hour = from.date_naive().and_hms_opt(from.hour(), 0, 0).unwrap() + chrono::Duration::hours(1);
            Utc.from_utc_datetime(&next_hour)
        }
        TimeWindow::Daily => {
            let tomorrow = from.date_naive().succ_opt().unwrap_or(from.date_naive());
            Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
        }
        TimeWindow::Monthly => {
            use chrono::Datelike;
            let (year, month) = if from.month() == 12 { (from.year() + 1, 1) } else { (from.year(), from.month() + 1) };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap()
        }
        TimeWindow::Custom => from + chrono::Duration::days(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::TracingObservability;
    use crate::store::InMemoryStateStore;
    use rust_decimal_macros::dec;

    fn controller() -> CostController {
        CostController::new(
            Arc::new(InMemoryStateStore::default()),
            Arc::new(TracingObservability::new()),
            Arc::new(ProviderRegistry::new()),
        )
    }

    #[tokio::test]
    async fn create_budget_requires_scope_id_for_non_global() {
        let ctrl = controller();
        let result = ctrl
            .create_budget(BudgetScope::PerProvider, dec!(100), TimeWindow::Daily, None, EnforcementMode::Hard)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn check_budget_allows_unbounded_with_no_budgets() {
        let ctrl = controller();
        let intent = sample_intent();
        let estimate = sample_estimate(dec!(5));
        let result = ctrl.check_budget(&intent, &estimate, None, None).await.unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn hard_budget_violation_raises_on_enforce() {
        let ctrl = controller();
        let budget = ctrl
            .create_budget(BudgetScope::Global, dec!(10), TimeWindow::Daily, None, EnforcementMode::Hard)
            .await
            .unwrap();
        ctrl.update_spending(&budget.id, dec!(9)).await.unwrap();

        let mut intent = sample_intent();
        let estimate = sample_estimate(dec!(5));
        let result = ctrl.enforce_budget(&mut intent, &estimate, None, None, false).await;
        assert!(matches!(result, Err(CostError::BudgetExceeded { .. })));
    }

    #[tokio::test]
    async fn soft_budget_violation_warns_without_erroring() {
        let ctrl = controller();
        let budget = ctrl
            .create_budget(BudgetScope::Global, dec!(10), TimeWindow::Daily, None, EnforcementMode::Soft)
            .await
            .unwrap();
        ctrl.update_spending(&budget.id, dec!(9)).await.unwrap();

        let mut intent = sample_intent();
        let estimate = sample_estimate(dec!(5));
        let result = ctrl.enforce_budget(&mut intent, &estimate, None, None, false).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.soft_violated_budgets.len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_error_percentage_handles_zero_estimate() {
        let ctrl = controller();
        let request_id = RequestId::new();
        ctrl.record_estimated_cost(&request_id, sample_estimate(Decimal::ZERO), None, None, None).await;
        let reconciliation = ctrl.record_actual_cost(&request_id, dec!(5)).await.unwrap();
        assert_eq!(reconciliation.error_percentage, Decimal::ONE_HUNDRED);
    }

    #[tokio::test]
    async fn reconciliation_missing_estimate_returns_none() {
        let ctrl = controller();
        let request_id = RequestId::new();
        assert!(ctrl.record_actual_cost(&request_id, dec!(5)).await.is_none());
    }

    fn sample_intent() -> RequestIntent {
        RequestIntent {
            provider_id: ProviderId::from("openai"),
            request_id: None,
            model: "gpt-4".to_string(),
            messages: Vec::new(),
            max_tokens: None,
            temperature: None,
            metadata: Default::default(),
        }
    }

    fn sample_estimate(amount: Decimal) -> CostEstimate {
        CostEstimate {
            amount,
            currency: crate::model::Currency::Usd,
            confidence: 0.9,
            estimation_method: crate::model::EstimationMethod::TokenBased,
            input_tokens_estimate: 100,
            output_tokens_estimate: 50,
        }
    }
}
