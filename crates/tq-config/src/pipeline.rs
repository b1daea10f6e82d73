//! Typed pipeline configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tq_redact::ValidationLimits;
use tracing::debug;

use crate::validate::{validate_pipeline, ValidationError, ValidationResult};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Environment variables that override individual fields.
pub const ENV_BATCH_SIZE: &str = "TQ_BATCH_SIZE";
pub const ENV_MAX_QUEUE_SIZE: &str = "TQ_MAX_QUEUE_SIZE";
pub const ENV_MAX_RETRY_ATTEMPTS: &str = "TQ_MAX_RETRY_ATTEMPTS";
pub const ENV_DEBUG: &str = "TQ_DEBUG";

/// Configuration surface of the telemetry pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Queue length ceiling; the oldest 10% is evicted at 90% fill.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Events older than this are purged before delivery.
    #[serde(default = "default_max_event_age_ms")]
    pub max_event_age_ms: u64,

    /// Maximum events per delivered batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Lifetime delivery attempts before an event is dropped.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Safety expiry of an unresolved in-flight batch marker.
    #[serde(default = "default_in_flight_timeout_ms")]
    pub in_flight_timeout_ms: u64,

    /// Ceiling on the serialized primary queue document.
    #[serde(default = "default_max_serialized_bytes")]
    pub max_serialized_bytes: usize,

    /// Upper bound on a single `Sink::send` call.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default)]
    pub debug: bool,

    /// Consent state before the host says otherwise. Must stay false by default.
    #[serde(default)]
    pub consent_default: bool,

    #[serde(default)]
    pub validation: ValidationLimits,
}

fn default_schema_version() -> String {
    crate::CONFIG_SCHEMA_VERSION.to_string()
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_event_age_ms() -> u64 {
    7 * DAY_MS
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    5 * 60 * 1000
}

fn default_in_flight_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_serialized_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            schema_version: default_schema_version(),
            max_queue_size: default_max_queue_size(),
            max_event_age_ms: default_max_event_age_ms(),
            batch_size: default_batch_size(),
            max_retry_attempts: default_max_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            in_flight_timeout_ms: default_in_flight_timeout_ms(),
            max_serialized_bytes: default_max_serialized_bytes(),
            send_timeout_ms: default_send_timeout_ms(),
            debug: false,
            consent_default: false,
            validation: ValidationLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json_str(raw: &str) -> ValidationResult<Self> {
        let config: PipelineConfig =
            serde_json::from_str(raw).map_err(|e| ValidationError::ParseError(e.to_string()))?;
        validate_pipeline(&config)?;
        Ok(config)
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> ValidationResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file missing, using defaults");
            return Ok(PipelineConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ValidationError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Apply `TQ_*` environment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> ValidationResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then re-validate.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ValidationResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = parse_override(ENV_BATCH_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_QUEUE_SIZE) {
            self.max_queue_size = parse_override(ENV_MAX_QUEUE_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_RETRY_ATTEMPTS) {
            self.max_retry_attempts = parse_override(ENV_MAX_RETRY_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DEBUG) {
            self.debug = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        validate_pipeline(self)
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> ValidationResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ValidationError::InvalidValue {
            field: key.to_string(),
            message: format!("cannot parse '{}'", raw),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_consent_defaults_to_false() {
        let config = PipelineConfig::default();
        assert!(!config.consent_default);
        let parsed = PipelineConfig::from_json_str("{}").unwrap();
        assert!(!parsed.consent_default);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"batch_size": 10, "debug": true}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert!(config.debug);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_event_age_ms, 7 * DAY_MS);
        assert_eq!(config.validation, ValidationLimits::default());
    }

    #[test]
    fn test_invalid_document_is_parse_error() {
        let err = PipelineConfig::from_json_str("not json").unwrap_err();
        assert_eq!(err.code(), 61);
    }

    #[test]
    fn test_semantic_error_surfaces_from_parse() {
        let err = PipelineConfig::from_json_str(r#"{"batch_size": 0}"#).unwrap_err();
        assert_eq!(err.code(), 65);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BATCH_SIZE, "25"),
            (ENV_MAX_QUEUE_SIZE, "500"),
            (ENV_DEBUG, "true"),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_queue_size, 500);
        assert!(config.debug);
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == ENV_BATCH_SIZE).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_BATCH_SIZE));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = PipelineConfig::default();
        let back = PipelineConfig::from_json_str(&config.to_json_pretty()).unwrap();
        assert_eq!(back, config);
    }
}
