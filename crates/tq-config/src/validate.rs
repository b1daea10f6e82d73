//! Configuration validation errors and semantic validation.

use thiserror::Error;

use crate::pipeline::PipelineConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate a pipeline configuration semantically.
pub fn validate_pipeline(config: &PipelineConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    if config.max_queue_size == 0 {
        return Err(invalid("max_queue_size", "Must be at least 1"));
    }
    if config.batch_size == 0 {
        return Err(invalid("batch_size", "Must be at least 1"));
    }
    if config.batch_size > config.max_queue_size {
        return Err(invalid(
            "batch_size",
            format!(
                "Must not exceed max_queue_size ({} > {})",
                config.batch_size, config.max_queue_size
            ),
        ));
    }
    if config.max_retry_attempts == 0 {
        return Err(invalid("max_retry_attempts", "Must be at least 1"));
    }
    if config.max_event_age_ms == 0 {
        return Err(invalid("max_event_age_ms", "Must be positive"));
    }
    if config.backoff_base_ms == 0 {
        return Err(invalid("backoff_base_ms", "Must be positive"));
    }
    if config.backoff_cap_ms < config.backoff_base_ms {
        return Err(invalid(
            "backoff_cap_ms",
            format!(
                "Must be >= backoff_base_ms ({} < {})",
                config.backoff_cap_ms, config.backoff_base_ms
            ),
        ));
    }
    if config.in_flight_timeout_ms == 0 {
        return Err(invalid("in_flight_timeout_ms", "Must be positive"));
    }
    if config.send_timeout_ms == 0 {
        return Err(invalid("send_timeout_ms", "Must be positive"));
    }
    // A batch must not expire from in-flight while its send can still succeed.
    if config.send_timeout_ms >= config.in_flight_timeout_ms {
        return Err(invalid(
            "send_timeout_ms",
            format!(
                "Must be < in_flight_timeout_ms ({} >= {})",
                config.send_timeout_ms, config.in_flight_timeout_ms
            ),
        ));
    }
    // An empty document is ~64 bytes; anything this small can never hold an event.
    if config.max_serialized_bytes < 1024 {
        return Err(invalid("max_serialized_bytes", "Must be at least 1024"));
    }

    let limits = &config.validation;
    if limits.max_depth == 0 {
        return Err(invalid("validation.max_depth", "Must be at least 1"));
    }
    if limits.max_bytes == 0 || limits.max_string_len == 0 || limits.max_name_len == 0 {
        return Err(invalid("validation", "Size limits must be positive"));
    }

    Ok(())
}
