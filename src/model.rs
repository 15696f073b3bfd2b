//! Core data model shared by every component (spec §3).
//!
//! All identifiers are opaque strings wrapped in newtypes so callers
//! cannot mix up a `KeyId` and a `RequestId` at compile time, the way
//! the teacher crate distinguishes `AgentId`-shaped strings by
//! constructor (`AiMessage::new`) even though the wire type is a
//! plain `String`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(KeyId);
opaque_id!(ProviderId);
opaque_id!(RequestId);
opaque_id!(CorrelationId);
opaque_id!(BudgetId);

// ---------------------------------------------------------------------
// API key lifecycle
// ---------------------------------------------------------------------

/// States an `APIKey` can occupy. Transitions are governed by the
/// matrix in `key_manager::TRANSITION_MATRIX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Available,
    Throttled,
    Exhausted,
    Recovering,
    Disabled,
    Invalid,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Bounded metadata map: at most 100 keys, string values at most
/// 10 KiB, nesting depth at most 3, primitive leaves only. Enforced
/// by `validation::validate_metadata`.
pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: KeyId,
    pub provider_id: ProviderId,
    /// Ciphertext of the key material; never plaintext.
    pub encrypted_material: Vec<u8>,
    pub state: KeyState,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub state_updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub failure_count: u64,
}

impl ApiKey {
    /// Invariant: `state = Throttled` iff `cooldown_until` is set.
    pub fn invariants_hold(&self) -> bool {
        (self.state == KeyState::Throttled) == self.cooldown_until.is_some()
    }
}

/// Append-only audit record for any `APIKey` (or other entity) state
/// change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub entity_type: String,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub trigger: String,
    pub context: HashMap<String, serde_json::Value>,
    pub transition_timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Quota awareness
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityState {
    Abundant,
    Constrained,
    Critical,
    Exhausted,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityUnit {
    Requests,
    Tokens,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Hourly,
    Daily,
    Monthly,
    Custom,
}

/// Tagged union for a capacity figure, per spec §3: exact / estimated
/// / bounded / unknown, each with a different confidence shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapacityEstimate {
    Exact { value: f64 },
    Estimated { value: f64, confidence: f64 },
    Bounded { min: f64, max: f64 },
    Unknown,
}

impl CapacityEstimate {
    pub fn confidence(&self) -> f64 {
        match self {
            CapacityEstimate::Exact { .. } => 1.0,
            CapacityEstimate::Estimated { confidence, .. } => *confidence,
            CapacityEstimate::Bounded { .. } => 0.6,
            CapacityEstimate::Unknown => 0.0,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            CapacityEstimate::Exact { value } => Some(*value),
            CapacityEstimate::Estimated { value, .. } => Some(*value),
            CapacityEstimate::Bounded { min, max } => Some((min + max) / 2.0),
            CapacityEstimate::Unknown => None,
        }
    }

    /// Multiplier applied to a confidence score by estimate type when
    /// blending into exhaustion-prediction confidence (spec §4.2).
    pub fn prediction_confidence_multiplier(&self) -> f64 {
        match self {
            CapacityEstimate::Exact { .. } => 1.0,
            CapacityEstimate::Estimated { .. } => 0.8,
            CapacityEstimate::Bounded { .. } => 0.6,
            CapacityEstimate::Unknown => 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaState {
    pub key_id: KeyId,
    pub capacity_state: CapacityState,
    pub capacity_unit: CapacityUnit,
    pub remaining_capacity: CapacityEstimate,
    pub total_capacity: Option<f64>,
    pub used_capacity: f64,
    /// Only meaningful when `capacity_unit = Mixed`.
    pub remaining_tokens: Option<CapacityEstimate>,
    pub total_tokens: Option<f64>,
    pub used_tokens: f64,
    pub used_requests: f64,
    pub time_window: TimeWindow,
    pub reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageRate {
    pub requests_per_hour: f64,
    pub tokens_per_hour: Option<f64>,
    pub window_hours: f64,
    pub calculated_at: DateTime<Utc>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyLevel {
    Low,
    Medium,
    High,
    Unknown,
}

impl UncertaintyLevel {
    pub fn promote(self) -> Self {
        match self {
            UncertaintyLevel::Low => UncertaintyLevel::Medium,
            UncertaintyLevel::Medium => UncertaintyLevel::High,
            UncertaintyLevel::High => UncertaintyLevel::Unknown,
            UncertaintyLevel::Unknown => UncertaintyLevel::Unknown,
        }
    }

    /// Conservative multiplier applied to raw predicted hours.
    pub fn time_multiplier(self) -> f64 {
        match self {
            UncertaintyLevel::Low => 1.0,
            UncertaintyLevel::Medium => 0.9,
            UncertaintyLevel::High => 0.75,
            UncertaintyLevel::Unknown => 0.5,
        }
    }

    /// Multiplier applied to blended confidence.
    pub fn confidence_multiplier(self) -> f64 {
        match self {
            UncertaintyLevel::Low => 1.0,
            UncertaintyLevel::Medium => 0.85,
            UncertaintyLevel::High => 0.7,
            UncertaintyLevel::Unknown => 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustionPrediction {
    pub key_id: KeyId,
    pub predicted_exhaustion_at: DateTime<Utc>,
    pub confidence: f64,
    pub calculation_method: String,
    pub current_usage_rate: f64,
    pub remaining_capacity: f64,
    pub calculated_at: DateTime<Utc>,
    pub uncertainty_level: UncertaintyLevel,
}

// ---------------------------------------------------------------------
// Cost control
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Global,
    PerProvider,
    PerKey,
    PerRoute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: BudgetId,
    pub scope: BudgetScope,
    pub scope_id: Option<String>,
    pub limit_amount: Decimal,
    pub current_spend: Decimal,
    pub period: TimeWindow,
    pub enforcement_mode: EnforcementMode,
    pub reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub warning_count: u64,
}

impl Budget {
    pub fn remaining_budget(&self) -> Decimal {
        self.limit_amount - self.current_spend
    }

    pub fn utilization_percent(&self) -> Decimal {
        if self.limit_amount.is_zero() {
            return Decimal::ZERO;
        }
        self.current_spend / self.limit_amount * Decimal::ONE_HUNDRED
    }

    pub fn is_exceeded(&self) -> bool {
        self.current_spend >= self.limit_amount
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostEstimate {
    pub amount: Decimal,
    pub currency: Currency,
    pub confidence: f64,
    pub estimation_method: EstimationMethod,
    pub input_tokens_estimate: u64,
    pub output_tokens_estimate: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    TokenBased,
    Heuristic,
    ProviderQuoted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReconciliation {
    pub request_id: RequestId,
    pub estimated_cost: Decimal,
    pub actual_cost: Decimal,
    pub error_amount: Decimal,
    pub error_percentage: Decimal,
    pub provider_id: Option<ProviderId>,
    pub model: Option<String>,
    pub key_id: Option<KeyId>,
    pub reconciled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveType {
    Cost,
    Reliability,
    Fairness,
    Quality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingObjective {
    pub primary: ObjectiveType,
    pub secondary: Vec<ObjectiveType>,
    /// Presence (non-empty) triggers multi-objective mode.
    pub weights: HashMap<ObjectiveType, f64>,
    pub constraints: HashMap<String, serde_json::Value>,
}

impl RoutingObjective {
    pub fn single(primary: ObjectiveType) -> Self {
        Self {
            primary,
            secondary: Vec::new(),
            weights: HashMap::new(),
            constraints: HashMap::new(),
        }
    }

    pub fn is_multi_objective(&self) -> bool {
        !self.weights.is_empty()
    }

    /// All distinct objectives referenced by primary, secondary, or
    /// weights (spec §4.4 step 2).
    pub fn referenced_objectives(&self) -> Vec<ObjectiveType> {
        let mut seen = Vec::new();
        let mut push = |o: ObjectiveType| {
            if !seen.contains(&o) {
                seen.push(o);
            }
        };
        push(self.primary);
        for s in &self.secondary {
            push(*s);
        }
        for o in self.weights.keys() {
            push(*o);
        }
        seen
    }
}

impl Default for RoutingObjective {
    fn default() -> Self {
        Self::single(ObjectiveType::Fairness)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheckResult {
    pub allowed: bool,
    pub remaining_budget: Decimal,
    pub violated_budgets: Vec<BudgetId>,
    pub soft_violated_budgets: Vec<BudgetId>,
}

impl BudgetCheckResult {
    pub fn allowed_unbounded() -> Self {
        Self {
            allowed: true,
            remaining_budget: Decimal::from(1_000_000_000i64),
            violated_budgets: Vec::new(),
            soft_violated_budgets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: f64,
    pub quota_state: Option<QuotaState>,
    pub cost_estimate: Option<CostEstimate>,
    pub budget_check: Option<BudgetCheckResult>,
    pub objective_scores: Option<HashMap<ObjectiveType, f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: String,
    pub request_id: RequestId,
    pub selected_key_id: KeyId,
    pub selected_provider_id: ProviderId,
    pub decision_timestamp: DateTime<Utc>,
    pub objective: RoutingObjective,
    pub eligible_keys: Vec<KeyId>,
    pub evaluation_results: HashMap<KeyId, EvaluationResult>,
    pub explanation: String,
    pub confidence: f64,
    pub alternatives_considered: Vec<KeyId>,
}

// ---------------------------------------------------------------------
// Request intent / provider surface shared types
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Caller-supplied description of a request: model, messages,
/// parameters, optional metadata (Glossary: "Intent").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestIntent {
    pub provider_id: ProviderId,
    pub request_id: Option<RequestId>,
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ProviderError,
    RateLimit,
    ProviderUnavailable,
    AuthenticationError,
    ValidationError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.category, self.message)
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_images: bool,
    pub max_tokens: Option<u32>,
    pub rate_limit_per_minute: Option<u32>,
    pub custom: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
}

/// Normalized token usage a provider reports back after execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemResponse {
    pub request_id: RequestId,
    pub key_used: KeyId,
    pub provider_id: ProviderId,
    pub content: String,
    pub token_usage: Option<TokenUsage>,
    pub actual_cost: Option<Decimal>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Raw HTTP-shaped response used by `handle_quota_response` (spec
/// §4.2): either a status-code carrying map, or an explicit struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaResponseSignal {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
}
