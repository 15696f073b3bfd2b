//! State Store (C1): durable storage for keys, quota states, routing
//! decisions, state transitions, and budgets. Out of scope per spec
//! §1 ("the state persistence backend"); this module defines the
//! trait contract plus an in-memory reference implementation, the way
//! the teacher's `storage::StorageLayer` backs its caches with
//! `DashMap` even though the "real" backend is the external Barq
//! services.
//!
//! Per spec §9's open question, this also adds `save_budget`/
//! `get_budget`/`list_budgets` and `save_reconciliation`/
//! `query_reconciliations` to the trait, since the original
//! implementation's `_save_budget_to_store`/`_save_reconciliation`
//! were no-ops over an in-memory dict and a faithful port needs an
//! explicit persistence API instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;

use crate::model::{ApiKey, Budget, BudgetId, CostReconciliation, KeyId, ProviderId, QuotaState, RoutingDecision, StateTransition};

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("budget not found: {0}")]
    BudgetNotFound(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Filters supported by `query_state` (spec §6).
#[derive(Debug, Clone, Default)]
pub struct StateQuery {
    pub entity_type: Option<String>,
    pub key_id: Option<KeyId>,
    pub provider_id: Option<ProviderId>,
    pub timestamp_from: Option<DateTime<Utc>>,
    pub timestamp_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_key(&self, key: &ApiKey) -> Result<(), StateStoreError>;
    async fn get_key(&self, id: &KeyId) -> Result<Option<ApiKey>, StateStoreError>;
    async fn list_keys(&self, provider_id: Option<&ProviderId>) -> Result<Vec<ApiKey>, StateStoreError>;
    async fn delete_key(&self, id: &KeyId) -> Result<(), StateStoreError>;

    async fn save_state_transition(&self, transition: &StateTransition) -> Result<(), StateStoreError>;

    async fn save_quota_state(&self, state: &QuotaState) -> Result<(), StateStoreError>;
    async fn get_quota_state(&self, key_id: &KeyId) -> Result<Option<QuotaState>, StateStoreError>;

    async fn save_routing_decision(&self, decision: &RoutingDecision) -> Result<(), StateStoreError>;

    async fn query_state(&self, query: &StateQuery) -> Result<Vec<StoredEntity>, StateStoreError>;

    async fn save_budget(&self, budget: &Budget) -> Result<(), StateStoreError>;
    async fn get_budget(&self, id: &BudgetId) -> Result<Option<Budget>, StateStoreError>;
    async fn list_budgets(&self) -> Result<Vec<Budget>, StateStoreError>;

    async fn save_reconciliation(&self, reconciliation: &CostReconciliation) -> Result<(), StateStoreError>;
    async fn query_reconciliations(&self, key_id: Option<&KeyId>) -> Result<Vec<CostReconciliation>, StateStoreError>;
}

/// A heterogeneous result row from `query_state`, since the interface
/// is queried across several entity kinds (transitions and routing
/// decisions are the two the core actually reads back).
#[derive(Debug, Clone)]
pub enum StoredEntity {
    Transition(StateTransition),
    Decision(RoutingDecision),
}

/// In-memory reference implementation. Bounded ring buffers cap the
/// append-only collections per the `max_decisions`/`max_transitions`
/// configuration options (spec §6), mirroring the teacher's
/// `routing_history` cap in `routing::CostAwareRouter::record_decision`.
pub struct InMemoryStateStore {
    keys: DashMap<String, ApiKey>,
    quota_states: DashMap<String, QuotaState>,
    budgets: DashMap<String, Budget>,
    transitions: RwLock<Vec<StateTransition>>,
    decisions: RwLock<Vec<RoutingDecision>>,
    reconciliations: RwLock<Vec<CostReconciliation>>,
    max_transitions: usize,
    max_decisions: usize,
}

impl InMemoryStateStore {
    pub fn new(max_transitions: usize, max_decisions: usize) -> Self {
        Self {
            keys: DashMap::new(),
            quota_states: DashMap::new(),
            budgets: DashMap::new(),
            transitions: RwLock::new(Vec::new()),
            decisions: RwLock::new(Vec::new()),
            reconciliations: RwLock::new(Vec::new()),
            max_transitions,
            max_decisions,
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}

impl From<crate::config::InMemoryStoreConfig> for InMemoryStateStore {
    fn from(config: crate::config::InMemoryStoreConfig) -> Self {
        Self::new(config.max_transitions, config.max_decisions)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_key(&self, key: &ApiKey) -> Result<(), StateStoreError> {
        self.keys.insert(key.id.as_str().to_string(), key.clone());
        Ok(())
    }

    async fn get_key(&self, id: &KeyId) -> Result<Option<ApiKey>, StateStoreError> {
        Ok(self.keys.get(id.as_str()).map(|r| r.clone()))
    }

    async fn list_keys(&self, provider_id: Option<&ProviderId>) -> Result<Vec<ApiKey>, StateStoreError> {
        Ok(self
            .keys
            .iter()
            .map(|r| r.clone())
            .filter(|k| provider_id.map(|p| &k.provider_id == p).unwrap_or(true))
            .collect())
    }

    async fn delete_key(&self, id: &KeyId) -> Result<(), StateStoreError> {
        self.keys.remove(id.as_str());
        Ok(())
    }

    async fn save_state_transition(&self, transition: &StateTransition) -> Result<(), StateStoreError> {
        let mut transitions = self.transitions.write();
        transitions.push(transition.clone());
        if transitions.len() > self.max_transitions {
            let overflow = transitions.len() - self.max_transitions;
            transitions.drain(0..overflow);
        }
        Ok(())
    }

    async fn save_quota_state(&self, state: &QuotaState) -> Result<(), StateStoreError> {
        self.quota_states.insert(state.key_id.as_str().to_string(), state.clone());
        Ok(())
    }

    async fn get_quota_state(&self, key_id: &KeyId) -> Result<Option<QuotaState>, StateStoreError> {
        Ok(self.quota_states.get(key_id.as_str()).map(|r| r.clone()))
    }

    async fn save_routing_decision(&self, decision: &RoutingDecision) -> Result<(), StateStoreError> {
        let mut decisions = self.decisions.write();
        decisions.push(decision.clone());
        if decisions.len() > self.max_decisions {
            let overflow = decisions.len() - self.max_decisions;
            decisions.drain(0..overflow);
        }
        Ok(())
    }

    async fn query_state(&self, query: &StateQuery) -> Result<Vec<StoredEntity>, StateStoreError> {
        let mut out = Vec::new();

        let want_transitions = query
            .entity_type
            .as_deref()
            .map(|t| t == "state_transition" || t == "*")
            .unwrap_or(true);
        let want_decisions = query
            .entity_type
            .as_deref()
            .map(|t| t == "routing_decision" || t == "*")
            .unwrap_or(true);

        if want_transitions {
            for t in self.transitions.read().iter() {
                if matches_window(t.transition_timestamp, query) && matches_key(&t.entity_id, &query.key_id) {
                    out.push(StoredEntity::Transition(t.clone()));
                }
            }
        }
        if want_decisions {
            for d in self.decisions.read().iter() {
                let key_matches = query
                    .key_id
                    .as_ref()
                    .map(|k| &d.selected_key_id == k)
                    .unwrap_or(true);
                let provider_matches = query
                    .provider_id
                    .as_ref()
                    .map(|p| &d.selected_provider_id == p)
                    .unwrap_or(true);
                if matches_window(d.decision_timestamp, query) && key_matches && provider_matches {
                    out.push(StoredEntity::Decision(d.clone()));
                }
            }
        }

        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn save_budget(&self, budget: &Budget) -> Result<(), StateStoreError> {
        self.budgets.insert(budget.id.as_str().to_string(), budget.clone());
        Ok(())
    }

    async fn get_budget(&self, id: &BudgetId) -> Result<Option<Budget>, StateStoreError> {
        Ok(self.budgets.get(id.as_str()).map(|r| r.clone()))
    }

    async fn list_budgets(&self) -> Result<Vec<Budget>, StateStoreError> {
        Ok(self.budgets.iter().map(|r| r.clone()).collect())
    }

    async fn save_reconciliation(&self, reconciliation: &CostReconciliation) -> Result<(), StateStoreError> {
        self.reconciliations.write().push(reconciliation.clone());
        Ok(())
    }

    async fn query_reconciliations(&self, key_id: Option<&KeyId>) -> Result<Vec<CostReconciliation>, StateStoreError> {
        Ok(self
            .reconciliations
            .read()
            .iter()
            .filter(|r| key_id.map(|k| r.key_id.as_ref() == Some(k)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

fn matches_window(ts: DateTime<Utc>, query: &StateQuery) -> bool {
    if let Some(from) = query.timestamp_from {
        if ts < from {
            return false;
        }
    }
    if let Some(to) = query.timestamp_to {
        if ts > to {
            return false;
        }
    }
    true
}

fn matches_key(entity_id: &str, key_id: &Option<KeyId>) -> bool {
    key_id.as_ref().map(|k| k.as_str() == entity_id).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiKey, KeyState};

    fn sample_key() -> ApiKey {
        ApiKey {
            id: KeyId::new(),
            provider_id: "openai".into(),
            encrypted_material: vec![1, 2, 3],
            state: KeyState::Available,
            metadata: Default::default(),
            created_at: Utc::now(),
            state_updated_at: Utc::now(),
            last_used_at: None,
            cooldown_until: None,
            usage_count: 0,
            failure_count: 0,
        }
    }

    #[tokio::test]
    async fn save_and_get_key_round_trips() {
        let store = InMemoryStateStore::default();
        let key = sample_key();
        store.save_key(&key).await.unwrap();
        let fetched = store.get_key(&key.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, key.id);
    }

    #[tokio::test]
    async fn transitions_ring_buffer_caps_at_max() {
        let store = InMemoryStateStore::new(3, 10);
        for i in 0..5 {
            let t = StateTransition {
                entity_type: "api_key".into(),
                entity_id: format!("k{i}"),
                from_state: "Available".into(),
                to_state: "Throttled".into(),
                trigger: "test".into(),
                context: Default::default(),
                transition_timestamp: Utc::now(),
            };
            store.save_state_transition(&t).await.unwrap();
        }
        assert_eq!(store.transitions.read().len(), 3);
    }
}
