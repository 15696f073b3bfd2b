//! Quota Awareness Engine (C5): forward-looking capacity model per key
//! plus proactive exhaustion detection (spec §4.2).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::QuotaEngineConfig;
use crate::key_manager::{KeyManager, KeyManagerError};
use crate::model::{
    CapacityEstimate, CapacityState, CapacityUnit, ExhaustionPrediction, KeyId, KeyState, ProviderId, QuotaState,
    StateTransition, TimeWindow, UncertaintyLevel, UsageRate,
};
use crate::observability::{EventType, ObservabilitySink};
use crate::store::{StateQuery, StateStore, StateStoreError, StoredEntity};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("consumption must be non-negative")]
    NegativeConsumption,
    #[error("tokens_consumed is required when capacity_unit is Mixed")]
    MissingTokenConsumption,
    #[error("response status code {0} is not a 429")]
    NotRateLimited(u16),
    #[error(transparent)]
    Store(#[from] StateStoreError),
}

struct CachedPrediction {
    prediction: ExhaustionPrediction,
    cached_at: DateTime<Utc>,
}

pub struct QuotaEngine {
    store: Arc<dyn StateStore>,
    observability: Arc<dyn ObservabilitySink>,
    config: QuotaEngineConfig,
    /// Per-key mutex table guarding first-time initialization. A
    /// single outer mutex (here, `DashMap`'s own sharded locking)
    /// guards creation of each per-key mutex, matching spec §5/§9's
    /// two-level lock.
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    prediction_cache: DashMap<String, CachedPrediction>,
    key_manager_hook: Option<Arc<KeyManager>>,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn StateStore>, observability: Arc<dyn ObservabilitySink>, config: QuotaEngineConfig) -> Self {
        Self {
            store,
            observability,
            config,
            key_locks: DashMap::new(),
            prediction_cache: DashMap::new(),
            key_manager_hook: None,
        }
    }

    pub fn with_key_manager_hook(mut self, key_manager: Arc<KeyManager>) -> Self {
        self.key_manager_hook = Some(key_manager);
        self
    }

    pub fn default_cooldown_seconds(&self) -> i64 {
        self.config.default_cooldown_seconds
    }

    fn lock_for(&self, key_id: &KeyId) -> Arc<AsyncMutex<()>> {
        self.key_locks
            .entry(key_id.as_str().to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn get_quota_state(&self, key_id: &KeyId) -> Result<QuotaState, QuotaError> {
        if let Some(state) = self.store.get_quota_state(key_id).await? {
            return Ok(state);
        }

        let lock = self.lock_for(key_id);
        let _guard = lock.lock().await;

        if let Some(state) = self.store.get_quota_state(key_id).await? {
            return Ok(state);
        }

        let now = Utc::now();
        let initial = QuotaState {
            key_id: key_id.clone(),
            capacity_state: CapacityState::Abundant,
            capacity_unit: CapacityUnit::Requests,
            remaining_capacity: CapacityEstimate::Unknown,
            total_capacity: None,
            used_capacity: 0.0,
            remaining_tokens: None,
            total_tokens: None,
            used_tokens: 0.0,
            used_requests: 0.0,
            time_window: TimeWindow::Daily,
            reset_at: next_utc_midnight(now),
            updated_at: now,
        };
        self.store.save_quota_state(&initial).await?;
        Ok(initial)
    }

    pub async fn update_capacity(
        &self,
        key_id: &KeyId,
        consumed: f64,
        tokens_consumed: Option<f64>,
    ) -> Result<QuotaState, QuotaError> {
        if consumed < 0.0 || tokens_consumed.map(|t| t < 0.0).unwrap_or(false) {
            return Err(QuotaError::NegativeConsumption);
        }
        if matches!(self.get_quota_state(key_id).await?.capacity_unit, CapacityUnit::Mixed) && tokens_consumed.is_none() {
            return Err(QuotaError::MissingTokenConsumption);
        }

        let mut state = self.get_quota_state(key_id).await?;
        let now = Utc::now();

        if now >= state.reset_at {
            state = self.reset(state).await?;
        }

        let previous_capacity_state = state.capacity_state;

        match state.capacity_unit {
            CapacityUnit::Requests => {
                state.remaining_capacity = decrement(state.remaining_capacity, consumed);
                state.used_capacity += consumed;
                state.used_requests += consumed;
            }
            CapacityUnit::Tokens => {
                let amount = tokens_consumed.unwrap_or(consumed);
                state.remaining_capacity = decrement(state.remaining_capacity, amount);
                state.used_capacity += amount;
                state.used_tokens += amount;
            }
            CapacityUnit::Mixed => {
                let tokens = tokens_consumed.expect("checked above");
                state.remaining_capacity = decrement(state.remaining_capacity, consumed);
                state.used_capacity += consumed;
                state.used_requests += consumed;
                state.remaining_tokens = state.remaining_tokens.map(|r| decrement(r, tokens));
                state.used_tokens += tokens;
            }
        }
        state.updated_at = now;

        let prediction = self.predict_exhaustion_internal(&state).await;
        state.capacity_state = capacity_state_for(&state, prediction.as_ref());

        self.store.save_quota_state(&state).await?;

        if state.capacity_state != previous_capacity_state {
            let trigger = if prediction.is_some() {
                "exhaustion_prediction"
            } else {
                "capacity_update"
            };
            let transition = StateTransition {
                entity_type: "quota_state".to_string(),
                entity_id: key_id.to_string(),
                from_state: format!("{:?}", previous_capacity_state),
                to_state: format!("{:?}", state.capacity_state),
                trigger: trigger.to_string(),
                context: HashMap::new(),
                transition_timestamp: now,
            };
            if let Err(e) = self.store.save_state_transition(&transition).await {
                warn!(error = %e, "failed to persist quota state transition, continuing");
            }
            self.observability
                .emit_event(
                    EventType::StateTransition,
                    serde_json::json!({"key_id": key_id.as_str(), "entity": "quota_state", "to": format!("{:?}", state.capacity_state)}),
                    None,
                )
                .await;
        }

        self.observability
            .emit_event(
                EventType::CapacityUpdated,
                serde_json::json!({"key_id": key_id.as_str(), "capacity_state": format!("{:?}", state.capacity_state)}),
                None,
            )
            .await;

        Ok(state)
    }

    async fn reset(&self, mut state: QuotaState) -> Result<QuotaState, QuotaError> {
        state.remaining_capacity = match state.total_capacity {
            Some(total) => CapacityEstimate::Exact { value: total },
            None => CapacityEstimate::Unknown,
        };
        state.used_capacity = 0.0;
        state.used_tokens = 0.0;
        state.used_requests = 0.0;
        if let Some(total_tokens) = state.total_tokens {
            state.remaining_tokens = Some(CapacityEstimate::Exact { value: total_tokens });
        }
        state.capacity_state = CapacityState::Abundant;
        state.reset_at = next_reset(state.time_window, state.reset_at);
        state.updated_at = Utc::now();

        self.store.save_quota_state(&state).await?;
        self.observability
            .emit_event(EventType::QuotaReset, serde_json::json!({"key_id": state.key_id.as_str()}), None)
            .await;
        Ok(state)
    }

    /// Handles a provider's 429 response: sets remaining to zero with
    /// full confidence, transitions the quota to `Exhausted`, and
    /// optionally throttles the key via the key-manager hook.
    pub async fn handle_quota_response(
        &self,
        key_id: &KeyId,
        status_code: u16,
        headers: &HashMap<String, String>,
        _provider_id: Option<&ProviderId>,
    ) -> Result<QuotaState, QuotaError> {
        if status_code != 429 {
            return Err(QuotaError::NotRateLimited(status_code));
        }

        let mut state = self.get_quota_state(key_id).await?;
        let retry_after = match parse_retry_after(headers) {
            RetryAfterOutcome::Parsed(seconds) => seconds,
            RetryAfterOutcome::Absent => self.config.default_cooldown_seconds,
            RetryAfterOutcome::Unparseable(raw) => {
                warn!(key_id = %key_id, retry_after = %raw, "Retry-After header present but unparseable, using default cooldown");
                self.config.default_cooldown_seconds
            }
        };

        state.remaining_capacity = CapacityEstimate::Exact { value: 0.0 };
        state.capacity_state = CapacityState::Exhausted;
        state.updated_at = Utc::now();
        self.store.save_quota_state(&state).await?;

        if let Some(key_manager) = &self.key_manager_hook {
            if let Err(e) = key_manager
                .update_key_state(key_id, KeyState::Throttled, "429_response", Some(retry_after), None)
                .await
            {
                warn!(error = %e, key_id = %key_id, "failed to throttle key after 429, continuing");
            }
        }

        self.observability
            .emit_event(
                EventType::QuotaExhausted,
                serde_json::json!({
                    "key_id": key_id.as_str(),
                    "retry_after_seconds": retry_after,
                    "cooldown_seconds": retry_after,
                }),
                None,
            )
            .await;

        Ok(state)
    }

    /// Usage rate over the trailing window, widening the window up to
    /// 24h if too few data points are available. Returns `None` rather
    /// than propagating store errors, matching the original's
    /// `except StateStoreError: return None`.
    pub async fn calculate_usage_rate(&self, key_id: &KeyId, window_hours: f64, min_data_points: usize) -> Option<UsageRate> {
        let mut window = window_hours;
        loop {
            let now = Utc::now();
            let from = now - chrono::Duration::milliseconds((window * 3_600_000.0) as i64);
            let query = StateQuery {
                entity_type: Some("routing_decision".to_string()),
                key_id: Some(key_id.clone()),
                provider_id: None,
                timestamp_from: Some(from),
                timestamp_to: Some(now),
                limit: None,
            };
            let rows = match self.store.query_state(&query).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "usage rate query failed, treating as no data");
                    return None;
                }
            };
            let decisions: Vec<_> = rows
                .into_iter()
                .filter_map(|r| match r {
                    StoredEntity::Decision(d) => Some(d),
                    _ => None,
                })
                .collect();

            if decisions.len() < min_data_points && window < 24.0 {
                window = (window * 2.0).min(24.0);
                continue;
            }
            if decisions.len() < min_data_points {
                return None;
            }

            let count = decisions.len() as f64;
            let requests_per_hour = count / window;

            let tokens_per_hour = {
                let mut total_tokens = 0.0;
                let mut found_any = false;
                for d in &decisions {
                    if let Some(eval) = d.evaluation_results.get(&d.selected_key_id) {
                        if let Some(cost) = &eval.cost_estimate {
                            total_tokens += (cost.input_tokens_estimate + cost.output_tokens_estimate) as f64;
                            found_any = true;
                        }
                    }
                }
                if found_any {
                    Some(total_tokens / window)
                } else {
                    None
                }
            };

            let mut confidence = (count / (min_data_points as f64 * 2.0).max(10.0)).min(1.0);
            if window < 1.0 {
                confidence *= 0.8;
            }

            return Some(UsageRate {
                requests_per_hour,
                tokens_per_hour,
                window_hours: window,
                calculated_at: now,
                confidence,
            });
        }
    }

    pub async fn predict_exhaustion(&self, key_id: &KeyId) -> Option<ExhaustionPrediction> {
        if let Some(cached) = self.prediction_cache.get(key_id.as_str()) {
            let age = Utc::now() - cached.cached_at;
            if age.num_seconds() < self.config.prediction_cache_ttl_seconds {
                return Some(cached.prediction.clone());
            }
        }
        let state = self.get_quota_state(key_id).await.ok()?;
        let prediction = self.predict_exhaustion_internal(&state).await;
        if let Some(p) = &prediction {
            self.prediction_cache.insert(
                key_id.as_str().to_string(),
                CachedPrediction {
                    prediction: p.clone(),
                    cached_at: Utc::now(),
                },
            );
        }
        prediction
    }

    async fn predict_exhaustion_internal(&self, state: &QuotaState) -> Option<ExhaustionPrediction> {
        let usage_rate = self.calculate_usage_rate(&state.key_id, 1.0, 3).await;

        let (remaining_estimate, rate) = match state.capacity_unit {
            CapacityUnit::Requests => {
                let rate = usage_rate.as_ref()?.requests_per_hour;
                (state.remaining_capacity, rate)
            }
            CapacityUnit::Tokens | CapacityUnit::Mixed => {
                let rate_opt = usage_rate.as_ref().and_then(|r| r.tokens_per_hour).or_else(|| {
                    usage_rate
                        .as_ref()
                        .filter(|r| r.requests_per_hour > 0.0)
                        .map(|r| r.requests_per_hour * 1000.0)
                });
                let rate = rate_opt?;
                let estimate = state.remaining_tokens.unwrap_or(state.remaining_capacity);
                (estimate, rate)
            }
        };

        let usage_rate = usage_rate?;
        if rate <= 0.0 {
            return None;
        }
        let remaining = remaining_estimate.value()?;
        if remaining <= 0.0 {
            return None;
        }

        let raw_hours = remaining / rate;
        if raw_hours < 0.0 {
            return None;
        }

        let uncertainty = calculate_uncertainty(remaining_estimate, Some(&usage_rate));
        let adjusted_hours = raw_hours * uncertainty.time_multiplier();

        let base_confidence = usage_rate.confidence * remaining_estimate.prediction_confidence_multiplier();
        let confidence = (base_confidence * uncertainty.confidence_multiplier()).clamp(0.0, 1.0);

        Some(ExhaustionPrediction {
            key_id: state.key_id.clone(),
            predicted_exhaustion_at: Utc::now() + chrono::Duration::milliseconds((adjusted_hours * 3_600_000.0) as i64),
            confidence,
            calculation_method: "linear_rate_extrapolation".to_string(),
            current_usage_rate: rate,
            remaining_capacity: remaining,
            calculated_at: Utc::now(),
            uncertainty_level: uncertainty,
        })
    }
}

/// Uncertainty level from the estimate's shape, promoted one level
/// when usage-rate or capacity confidence is weak (spec §4.2).
pub fn calculate_uncertainty(estimate: CapacityEstimate, usage_rate: Option<&UsageRate>) -> UncertaintyLevel {
    let base = match estimate {
        CapacityEstimate::Exact { .. } => UncertaintyLevel::Low,
        CapacityEstimate::Estimated { .. } => UncertaintyLevel::Medium,
        CapacityEstimate::Bounded { .. } => UncertaintyLevel::High,
        CapacityEstimate::Unknown => UncertaintyLevel::Unknown,
    };
    let weak_rate = usage_rate.map(|r| r.confidence < 0.5).unwrap_or(true);
    let weak_capacity = estimate.confidence() < 0.5;
    if weak_rate || weak_capacity {
        base.promote()
    } else {
        base
    }
}

/// Capacity-state decision (spec §4.2): a fresh prediction's
/// hours-until-exhaustion overrides the percentage bands when present.
pub fn capacity_state_for(state: &QuotaState, prediction: Option<&ExhaustionPrediction>) -> CapacityState {
    if let Some(prediction) = prediction {
        let hours = (prediction.predicted_exhaustion_at - Utc::now()).num_seconds() as f64 / 3600.0;
        if hours < 4.0 {
            return CapacityState::Critical;
        }
        if hours < 24.0 {
            return CapacityState::Constrained;
        }
        return CapacityState::Abundant;
    }

    match (state.remaining_capacity.value(), state.total_capacity) {
        (_, Some(total)) if total == 0.0 => CapacityState::Exhausted,
        (Some(remaining), Some(total)) if total > 0.0 => {
            let pct = remaining / total;
            if pct > 0.80 {
                CapacityState::Abundant
            } else if pct > 0.50 {
                CapacityState::Constrained
            } else if pct > 0.20 {
                CapacityState::Critical
            } else {
                CapacityState::Exhausted
            }
        }
        (Some(remaining), None) if remaining == 0.0 => CapacityState::Exhausted,
        (None, None) => CapacityState::Abundant,
        _ => CapacityState::Abundant,
    }
}

fn decrement(estimate: CapacityEstimate, amount: f64) -> CapacityEstimate {
    match estimate {
        CapacityEstimate::Exact { value } => CapacityEstimate::Exact {
            value: (value - amount).max(0.0),
        },
        CapacityEstimate::Estimated { value, confidence } => CapacityEstimate::Estimated {
            value: (value - amount).max(0.0),
            confidence,
        },
        CapacityEstimate::Bounded { min, max } => CapacityEstimate::Bounded {
            min: (min - amount).max(0.0),
            max: (max - amount).max(0.0),
        },
        CapacityEstimate::Unknown => CapacityEstimate::Unknown,
    }
}

fn next_utc_midnight(from: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = from.date_naive().succ_opt().unwrap_or(from.date_naive());
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
}

fn next_reset(window: TimeWindow, previous_reset_at: DateTime<Utc>) -> DateTime<Utc> {
    match window {
        TimeWindow::Hourly => {
            let now = Utc::now();
            let next_hour = now.date_naive().and_hms_opt(now.hour(), 0, 0).unwrap() + chrono::Duration::hours(1);
            Utc.from_utc_datetime(&next_hour)
        }
        TimeWindow::Daily => next_utc_midnight(Utc::now()),
        TimeWindow::Monthly => {
            let now = Utc::now();
            let (year, month) = if now.month() == 12 { (now.year() + 1, 1) } else { (now.year(), now.month() + 1) };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap()
        }
        // Custom windows do not auto-advance; caller controls reset_at.
        TimeWindow::Custom => previous_reset_at,
    }
}

/// Result of looking for a `Retry-After` header: the original
/// (`quota_awareness_engine.py`'s `_extract_retry_after`) only logs a
/// warning when the header is present but fails to parse, not when
/// it's simply absent — so the two cases must stay distinguishable
/// all the way to the caller.
enum RetryAfterOutcome {
    Absent,
    Parsed(i64),
    Unparseable(String),
}

fn parse_retry_after(headers: &HashMap<String, String>) -> RetryAfterOutcome {
    let value = match headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
        .map(|(_, v)| v.trim().to_string())
    {
        Some(v) => v,
        None => return RetryAfterOutcome::Absent,
    };

    if let Ok(seconds) = value.parse::<i64>() {
        return RetryAfterOutcome::Parsed(seconds);
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(&value) {
        let delta = date.with_timezone(&Utc) - Utc::now();
        return RetryAfterOutcome::Parsed(delta.num_seconds().max(0));
    }
    RetryAfterOutcome::Unparseable(value)
}
