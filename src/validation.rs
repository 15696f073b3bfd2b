//! Input validation for key material, provider ids, and metadata.
//!
//! Ported from the original implementation's
//! `infrastructure/utils/validation.py`: length bounds, character
//! classes, and a small injection-pattern denylist. Kept as plain
//! functions rather than a trait since the core always calls the same
//! concrete rules (spec §1 lists a general-purpose validation layer as
//! an external collaborator, but Key Manager's own operations specify
//! these exact checks inline).

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::model::Metadata;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("validation error in '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

struct InjectionPattern {
    name: &'static str,
    needles: &'static [&'static str],
}

// A small, explicit denylist rather than a regex engine: the spec only
// asks that obviously malicious payloads never reach encryption or
// storage, not that this be a complete WAF.
static INJECTION_NEEDLES: Lazy<Vec<InjectionPattern>> = Lazy::new(|| {
    vec![
        InjectionPattern {
            name: "sql",
            needles: &[
                "union select",
                "select * from",
                "insert into",
                "delete from",
                "drop table",
                "' or '1'='1",
            ],
        },
        InjectionPattern {
            name: "nosql",
            needles: &["$where", "$ne", "$gt", "$lt", "$regex", "$exists"],
        },
        InjectionPattern {
            name: "script",
            needles: &["<script", "javascript:", "onerror=", "onload="],
        },
        InjectionPattern {
            name: "path-traversal",
            needles: &["../", "..\\", "%2e%2e%2f"],
        },
    ]
});

const COMMAND_INJECTION_CHARS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>'];

pub fn detect_injection_attempt(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    if value.chars().any(|c| COMMAND_INJECTION_CHARS.contains(&c)) {
        return true;
    }
    INJECTION_NEEDLES
        .iter()
        .any(|p| p.needles.iter().any(|needle| lower.contains(needle)))
}

/// Validates API key material: non-empty after trim, 10-500 chars, no
/// control characters other than tab/CR/LF, and no injection patterns.
pub fn validate_key_material(material: &str) -> Result<(), ValidationError> {
    let trimmed = material.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("key_material", "key material cannot be empty"));
    }
    if trimmed.chars().count() < 10 {
        return Err(ValidationError::new(
            "key_material",
            "key material must be at least 10 characters long",
        ));
    }
    if trimmed.chars().count() > 500 {
        return Err(ValidationError::new(
            "key_material",
            "key material must be 500 characters or less",
        ));
    }
    if detect_injection_attempt(trimmed) {
        return Err(ValidationError::new(
            "key_material",
            "key material contains potentially malicious content",
        ));
    }
    if trimmed
        .chars()
        .any(|c| (c as u32) < 32 && c != '\t' && c != '\n' && c != '\r')
    {
        return Err(ValidationError::new(
            "key_material",
            "key material contains invalid control characters",
        ));
    }
    Ok(())
}

/// Validates a provider id: lowercase letters, digits, underscore,
/// 1-100 chars.
pub fn validate_provider_id(provider_id: &str) -> Result<(), ValidationError> {
    let trimmed = provider_id.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("provider_id", "provider id cannot be empty"));
    }
    if trimmed.chars().count() > 100 {
        return Err(ValidationError::new(
            "provider_id",
            "provider id must be 100 characters or less",
        ));
    }
    let lowered = trimmed.to_ascii_lowercase();
    if !lowered
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ValidationError::new(
            "provider_id",
            "provider id must contain only lowercase letters, numbers, and underscores",
        ));
    }
    if detect_injection_attempt(trimmed) {
        return Err(ValidationError::new(
            "provider_id",
            "provider id contains potentially malicious content",
        ));
    }
    Ok(())
}

const MAX_METADATA_KEYS: usize = 100;
const MAX_METADATA_VALUE_BYTES: usize = 10 * 1024;
const MAX_METADATA_DEPTH: u32 = 3;

/// Validates a metadata map: at most 100 keys, key format restricted,
/// string values at most 10 KiB, nesting depth at most 3, primitive
/// leaves only.
pub fn validate_metadata(metadata: &Metadata) -> Result<(), ValidationError> {
    if metadata.len() > MAX_METADATA_KEYS {
        return Err(ValidationError::new(
            "metadata",
            "metadata cannot contain more than 100 keys",
        ));
    }
    for (key, value) in metadata {
        validate_metadata_key(key)?;
        validate_metadata_value(value, 1)?;
    }
    Ok(())
}

fn validate_metadata_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::new("metadata", "metadata keys cannot be empty"));
    }
    if key.chars().count() > 100 {
        return Err(ValidationError::new(
            "metadata",
            "metadata keys must be 100 characters or less",
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::new(
            "metadata",
            "metadata keys must contain only letters, numbers, underscores, and hyphens",
        ));
    }
    Ok(())
}

fn validate_metadata_value(value: &serde_json::Value, depth: u32) -> Result<(), ValidationError> {
    if depth > MAX_METADATA_DEPTH {
        return Err(ValidationError::new("metadata", "metadata nesting depth exceeds 3"));
    }
    match value {
        serde_json::Value::String(s) => {
            if s.len() > MAX_METADATA_VALUE_BYTES {
                return Err(ValidationError::new(
                    "metadata",
                    "metadata string values must be 10KB or less",
                ));
            }
            Ok(())
        }
        serde_json::Value::Number(_) | serde_json::Value::Bool(_) | serde_json::Value::Null => Ok(()),
        serde_json::Value::Array(items) => {
            for item in items {
                validate_metadata_value(item, depth + 1)?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                validate_metadata_key(k)?;
                validate_metadata_value(v, depth + 1)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_material() {
        assert!(validate_key_material("short").is_err());
    }

    #[test]
    fn accepts_known_prefix() {
        assert!(validate_key_material("sk-abcdefghijklmnop").is_ok());
    }

    #[test]
    fn rejects_command_injection_chars() {
        assert!(validate_key_material("sk-abc;rm -rf /;def").is_err());
    }

    #[test]
    fn rejects_control_chars() {
        assert!(validate_key_material("sk-abc\x01defghij").is_err());
    }

    #[test]
    fn provider_id_must_be_lowercase_alnum_underscore() {
        assert!(validate_provider_id("openai_v2").is_ok());
        assert!(validate_provider_id("Open AI!").is_err());
    }

    #[test]
    fn metadata_depth_enforced() {
        let nested = serde_json::json!({"a": {"b": {"c": {"d": 1}}}});
        let mut metadata = Metadata::new();
        metadata.insert("k".to_string(), nested);
        assert!(validate_metadata(&metadata).is_err());
    }

    #[test]
    fn metadata_key_count_enforced() {
        let mut metadata = Metadata::new();
        for i in 0..101 {
            metadata.insert(format!("k{i}"), serde_json::Value::Bool(true));
        }
        assert!(validate_metadata(&metadata).is_err());
    }
}
