//! Key Manager (C4): sole authority on `APIKey` identity, state, and
//! material secrecy (spec §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::config::KeyManagerConfig;
use crate::crypto::{CryptoError, MaterialCipher};
use crate::model::{ApiKey, KeyId, KeyState, Metadata, ProviderId, StateTransition};
use crate::observability::{EventType, LogLevel, ObservabilitySink};
use crate::store::{StateStore, StateStoreError};
use crate::validation::{self, ValidationError};

#[derive(Debug, Error)]
pub enum KeyManagerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: KeyState, to: KeyState },
    #[error("key registration failed: {0}")]
    Registration(String),
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Legal state transitions, spec §4.1's matrix. `true` entries marked
/// "(noop)" in the spec are the diagonal and are always legal.
fn is_legal_transition(from: KeyState, to: KeyState) -> bool {
    use KeyState::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Available, Throttled)
            | (Available, Exhausted)
            | (Available, Disabled)
            | (Available, Invalid)
            | (Throttled, Available)
            | (Throttled, Exhausted)
            | (Throttled, Disabled)
            | (Throttled, Invalid)
            | (Exhausted, Recovering)
            | (Exhausted, Disabled)
            | (Exhausted, Invalid)
            | (Recovering, Available)
            | (Recovering, Disabled)
            | (Recovering, Invalid)
            | (Disabled, Available)
            | (Invalid, Disabled)
    )
}

/// Policy hook applied after state filtering in `get_eligible_keys`.
/// If it panics or the implementor prefers to signal failure, the
/// fallback is the state-filtered set (spec §4.1).
pub trait EligibilityPolicy: Send + Sync {
    fn filter(&self, keys: &[ApiKey]) -> Option<Vec<ApiKey>>;
}

pub struct KeyManager {
    store: Arc<dyn StateStore>,
    observability: Arc<dyn ObservabilitySink>,
    cipher: Arc<MaterialCipher>,
    config: KeyManagerConfig,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        observability: Arc<dyn ObservabilitySink>,
        cipher: Arc<MaterialCipher>,
        config: KeyManagerConfig,
    ) -> Self {
        Self {
            store,
            observability,
            cipher,
            config,
        }
    }

    pub async fn register_key(
        &self,
        material: &str,
        provider_id: &str,
        metadata: Option<Metadata>,
    ) -> Result<ApiKey, KeyManagerError> {
        validation::validate_key_material(material)?;
        validation::validate_provider_id(provider_id)?;
        let metadata = metadata.unwrap_or_default();
        validation::validate_metadata(&metadata)?;

        let encrypted_material = self
            .cipher
            .encrypt(material.trim())
            .map_err(|e| KeyManagerError::Registration(e.to_string()))?;

        let now = Utc::now();
        let key = ApiKey {
            id: KeyId::new(),
            provider_id: ProviderId::from(provider_id.to_ascii_lowercase()),
            encrypted_material,
            state: KeyState::Available,
            metadata,
            created_at: now,
            state_updated_at: now,
            last_used_at: None,
            cooldown_until: None,
            usage_count: 0,
            failure_count: 0,
        };

        self.store.save_key(&key).await?;

        self.observability
            .emit_event(
                EventType::KeyRegistered,
                serde_json::json!({"key_id": key.id.as_str(), "provider_id": key.provider_id.as_str()}),
                None,
            )
            .await;

        Ok(key)
    }

    pub async fn get_key(&self, id: &KeyId) -> Result<Option<ApiKey>, KeyManagerError> {
        Ok(self.store.get_key(id).await?)
    }

    pub async fn list_keys(&self, provider_id: Option<&ProviderId>) -> Result<Vec<ApiKey>, KeyManagerError> {
        Ok(self.store.list_keys(provider_id).await?)
    }

    /// Decrypts key material on demand. Never logs the plaintext;
    /// always emits exactly one `key_access` audit event.
    pub async fn get_key_material(&self, id: &KeyId) -> Result<String, KeyManagerError> {
        let key = self
            .store
            .get_key(id)
            .await?
            .ok_or_else(|| KeyManagerError::KeyNotFound(id.to_string()))?;

        let result = self.cipher.decrypt(&key.encrypted_material);

        self.observability
            .emit_event(
                EventType::KeyAccess,
                serde_json::json!({
                    "key_id": id.as_str(),
                    "operation": "decrypt",
                    "result": if result.is_ok() { "success" } else { "failure" },
                }),
                None,
            )
            .await;

        Ok(result?)
    }

    pub async fn update_key_state(
        &self,
        id: &KeyId,
        new_state: KeyState,
        reason: &str,
        cooldown_seconds: Option<i64>,
        context: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<StateTransition, KeyManagerError> {
        let mut key = self
            .store
            .get_key(id)
            .await?
            .ok_or_else(|| KeyManagerError::KeyNotFound(id.to_string()))?;

        if !is_legal_transition(key.state, new_state) {
            return Err(KeyManagerError::InvalidStateTransition {
                from: key.state,
                to: new_state,
            });
        }

        let from_state = key.state;
        let now = Utc::now();

        key.state = new_state;
        key.state_updated_at = now;

        if new_state == KeyState::Throttled {
            let seconds = cooldown_seconds.unwrap_or(self.config.default_cooldown_seconds);
            key.cooldown_until = Some(now + chrono::Duration::seconds(seconds));
        } else if from_state == KeyState::Throttled {
            key.cooldown_until = None;
        }

        self.store.save_key(&key).await?;

        let transition = StateTransition {
            entity_type: "api_key".to_string(),
            entity_id: id.to_string(),
            from_state: from_state.to_string(),
            to_state: new_state.to_string(),
            trigger: reason.to_string(),
            context: context.unwrap_or_default(),
            transition_timestamp: now,
        };

        if let Err(e) = self.store.save_state_transition(&transition).await {
            warn!(error = %e, "failed to persist state transition, continuing");
        }

        self.observability
            .emit_event(
                EventType::StateTransition,
                serde_json::json!({
                    "key_id": id.as_str(),
                    "from": from_state.to_string(),
                    "to": new_state.to_string(),
                    "trigger": reason,
                }),
                None,
            )
            .await;

        Ok(transition)
    }

    /// Bumps `usage_count` and `last_used_at` after a successful
    /// request. Not a state transition, so it bypasses the matrix and
    /// writes directly through the store.
    pub async fn record_usage(&self, id: &KeyId) -> Result<ApiKey, KeyManagerError> {
        let mut key = self
            .store
            .get_key(id)
            .await?
            .ok_or_else(|| KeyManagerError::KeyNotFound(id.to_string()))?;

        key.usage_count += 1;
        key.last_used_at = Some(Utc::now());
        self.store.save_key(&key).await?;
        Ok(key)
    }

    pub async fn revoke_key(&self, id: &KeyId) -> Result<StateTransition, KeyManagerError> {
        let transition = self
            .update_key_state(id, KeyState::Disabled, "manual_revocation", None, None)
            .await?;
        self.observability
            .emit_event(EventType::KeyRevoked, serde_json::json!({"key_id": id.as_str()}), None)
            .await;
        Ok(transition)
    }

    /// Preserves `id`, `provider_id`, `state`, `metadata`, counters,
    /// `created_at`; replaces encrypted material only.
    pub async fn rotate_key(&self, id: &KeyId, new_material: &str) -> Result<ApiKey, KeyManagerError> {
        validation::validate_key_material(new_material)?;

        let mut key = self
            .store
            .get_key(id)
            .await?
            .ok_or_else(|| KeyManagerError::KeyNotFound(id.to_string()))?;

        key.encrypted_material = self
            .cipher
            .encrypt(new_material.trim())
            .map_err(|e| KeyManagerError::Registration(e.to_string()))?;

        self.store.save_key(&key).await?;

        let transition = StateTransition {
            entity_type: "api_key".to_string(),
            entity_id: id.to_string(),
            from_state: key.state.to_string(),
            to_state: key.state.to_string(),
            trigger: "rotation".to_string(),
            context: HashMap::from([("material_updated".to_string(), serde_json::Value::Bool(true))]),
            transition_timestamp: Utc::now(),
        };
        if let Err(e) = self.store.save_state_transition(&transition).await {
            warn!(error = %e, "failed to persist rotation transition, continuing");
        }

        self.observability
            .emit_event(EventType::KeyRotated, serde_json::json!({"key_id": id.as_str()}), None)
            .await;

        Ok(key)
    }

    /// Scans all `Throttled` keys whose cooldown has elapsed and
    /// transitions them back to `Available`. Per-key errors are
    /// logged and do not stop the sweep.
    pub async fn check_and_recover_states(&self) -> Result<usize, KeyManagerError> {
        let keys = self.store.list_keys(None).await?;
        let now = Utc::now();
        let mut recovered = 0;

        for key in keys {
            if key.state != KeyState::Throttled {
                continue;
            }
            let due = key.cooldown_until.map(|t| t <= now).unwrap_or(false);
            if !due {
                continue;
            }
            match self
                .update_key_state(&key.id, KeyState::Available, "cooldown_elapsed", None, None)
                .await
            {
                Ok(_) => recovered += 1,
                Err(e) => {
                    self.observability.log(
                        LogLevel::Warning,
                        &format!("failed to recover key {} from cooldown: {e}", key.id),
                        None,
                    );
                }
            }
        }
        Ok(recovered)
    }

    /// Keys eligible to serve a request for `provider_id`: excludes
    /// `Disabled`, `Invalid`, `Exhausted`, and `Throttled` still in
    /// cooldown; includes `Available`, `Recovering`, and `Throttled`
    /// with an elapsed or absent cooldown.
    pub async fn get_eligible_keys(
        &self,
        provider_id: &ProviderId,
        policy: Option<&dyn EligibilityPolicy>,
    ) -> Result<Vec<ApiKey>, KeyManagerError> {
        let all = self.store.list_keys(Some(provider_id)).await?;
        let now = Utc::now();

        let filtered: Vec<ApiKey> = all
            .into_iter()
            .filter(|k| match k.state {
                KeyState::Disabled | KeyState::Invalid | KeyState::Exhausted => false,
                KeyState::Throttled => k.cooldown_until.map(|t| t <= now).unwrap_or(true),
                KeyState::Available | KeyState::Recovering => true,
            })
            .collect();

        if let Some(policy) = policy {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| policy.filter(&filtered))) {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {
                    self.observability
                        .log(LogLevel::Warning, "eligibility policy declined, using state-filtered set", None);
                }
                Err(_) => {
                    self.observability
                        .log(LogLevel::Warning, "eligibility policy panicked, using state-filtered set", None);
                }
            }
        }

        Ok(filtered)
    }
}
