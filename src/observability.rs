//! Observability (C2): structured events plus leveled logs. Never
//! receives secrets (spec §6). Out of scope as a sink implementation
//! (spec §1), but the core depends on emitting a fixed event catalog,
//! so this module defines the trait plus a `tracing`-backed default
//! implementation — generalizing the teacher's ad hoc
//! `ObservabilityLayer` counters into the named-event model the spec
//! requires, while keeping its counter/histogram machinery for the
//! optional Prometheus export in `metrics.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

/// Event types the core emits (spec §6, reproduced verbatim as an enum
/// so emission sites can't typo a string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    KeyRegistered,
    KeyRotated,
    KeyRevoked,
    KeyAccess,
    StateTransition,
    CapacityUpdated,
    QuotaReset,
    QuotaExhausted,
    CostEstimated,
    BudgetCreated,
    BudgetSpendingUpdated,
    BudgetChecked,
    BudgetWarning,
    BudgetViolation,
    CostEstimateRecorded,
    CostReconciled,
    CostModelAnalysis,
    ProviderRegistered,
    RoutingDecision,
    RoutingFailed,
    RequestCompleted,
    RequestFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::KeyRegistered => "key_registered",
            EventType::KeyRotated => "key_rotated",
            EventType::KeyRevoked => "key_revoked",
            EventType::KeyAccess => "key_access",
            EventType::StateTransition => "state_transition",
            EventType::CapacityUpdated => "capacity_updated",
            EventType::QuotaReset => "quota_reset",
            EventType::QuotaExhausted => "quota_exhausted",
            EventType::CostEstimated => "cost_estimated",
            EventType::BudgetCreated => "budget_created",
            EventType::BudgetSpendingUpdated => "budget_spending_updated",
            EventType::BudgetChecked => "budget_checked",
            EventType::BudgetWarning => "budget_warning",
            EventType::BudgetViolation => "budget_violation",
            EventType::CostEstimateRecorded => "cost_estimate_recorded",
            EventType::CostReconciled => "cost_reconciled",
            EventType::CostModelAnalysis => "cost_model_analysis",
            EventType::ProviderRegistered => "provider_registered",
            EventType::RoutingDecision => "routing_decision",
            EventType::RoutingFailed => "routing_failed",
            EventType::RequestCompleted => "request_completed",
            EventType::RequestFailed => "request_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Sink contract. `emit_event` is semantically non-blocking: a failing
/// sink implementation must not propagate an error out of the core —
/// callers treat any error here as a logged warning (spec §7).
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn emit_event(&self, event_type: EventType, payload: serde_json::Value, metadata: Option<serde_json::Value>);

    fn log(&self, level: LogLevel, message: &str, context: Option<serde_json::Value>);
}

/// Default sink: structured `tracing` events/logs plus lightweight
/// in-process counters for the handful of metrics worth exposing
/// without a full exporter (teacher's `observability::Counter`
/// pattern, generalized to one counter per event type instead of a
/// fixed message/success/failure triad).
pub struct TracingObservability {
    counters: dashmap::DashMap<&'static str, AtomicU64>,
}

impl TracingObservability {
    pub fn new() -> Self {
        Self {
            counters: dashmap::DashMap::new(),
        }
    }

    pub fn event_count(&self, event_type: EventType) -> u64 {
        self.counters
            .get(event_type.as_str())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .iter()
            .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for TracingObservability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObservabilitySink for TracingObservability {
    async fn emit_event(&self, event_type: EventType, payload: serde_json::Value, metadata: Option<serde_json::Value>) {
        self.counters
            .entry(event_type.as_str())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            event = event_type.as_str(),
            payload = %payload,
            metadata = ?metadata,
            "event emitted"
        );
    }

    fn log(&self, level: LogLevel, message: &str, context: Option<serde_json::Value>) {
        match level {
            LogLevel::Debug => debug!(context = ?context, "{message}"),
            LogLevel::Info => info!(context = ?context, "{message}"),
            LogLevel::Warning => warn!(context = ?context, "{message}"),
            LogLevel::Error => error!(context = ?context, "{message}"),
        }
    }
}

/// Emits an event, swallowing the fact that the sink itself cannot
/// fail (trait signature has no `Result`) but logging locally if a
/// caller wraps this with a fallible sink adapter. Kept as a free
/// function so components don't need to repeat the `.await` + ignore
/// pattern at every call site.
pub async fn emit(sink: &dyn ObservabilitySink, event_type: EventType, payload: serde_json::Value) {
    sink.emit_event(event_type, payload, None).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_events_by_type() {
        let sink = TracingObservability::new();
        emit(&sink, EventType::KeyRegistered, serde_json::json!({"id": "k1"})).await;
        emit(&sink, EventType::KeyRegistered, serde_json::json!({"id": "k2"})).await;
        assert_eq!(sink.event_count(EventType::KeyRegistered), 2);
    }
}
