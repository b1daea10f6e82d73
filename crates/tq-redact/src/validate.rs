//! Property validation applied before an event is admitted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tq_common::Properties;

use crate::detect::{is_denied_key, PiiDetector, PiiType};

/// Why a property map (or event name) was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("properties serialize to {bytes} bytes (max {max})")]
    TooLarge { bytes: usize, max: usize },

    #[error("{count} properties (max {max})")]
    TooManyKeys { count: usize, max: usize },

    #[error("property key '{key}' is on the PII denylist")]
    DeniedKey { key: String },

    #[error("string value at '{path}' is {len} chars (max {max})")]
    StringTooLong { path: String, len: usize, max: usize },

    #[error("value at '{path}' nests {depth} levels (max {max})")]
    TooDeep { path: String, depth: usize, max: usize },

    #[error("value at '{path}' looks like {kind}")]
    PiiDetected { path: String, kind: PiiType },

    #[error("invalid event name: {0}")]
    InvalidName(String),

    #[error("properties could not be serialized: {0}")]
    Serialization(String),
}

/// Outcome of validating a property map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub error: Option<ValidationIssue>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        ValidationReport {
            valid: true,
            error: None,
        }
    }

    pub fn reject(issue: ValidationIssue) -> Self {
        ValidationReport {
            valid: false,
            error: Some(issue),
        }
    }

    pub fn into_result(self) -> Result<(), ValidationIssue> {
        match self.error {
            Some(issue) => Err(issue),
            None if self.valid => Ok(()),
            None => Err(ValidationIssue::Serialization("rejected".to_string())),
        }
    }
}

/// Pluggable admission check for event names and properties.
pub trait PropertyValidator: Send + Sync {
    /// Validate a property map.
    fn validate(&self, properties: &Properties) -> ValidationReport;

    /// Validate an event name. Accepts everything unless overridden.
    fn validate_name(&self, _name: &str) -> ValidationReport {
        ValidationReport::ok()
    }
}

/// Size and shape ceilings for property maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Ceiling on the serialized JSON size of the whole map.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Ceiling on any single string value (in chars).
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,

    /// Deepest allowed nesting; the top-level map is depth 1.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Ceiling on the number of top-level keys.
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Ceiling on event name length.
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
}

fn default_max_bytes() -> usize {
    8 * 1024
}

fn default_max_string_len() -> usize {
    1000
}

fn default_max_depth() -> usize {
    3
}

fn default_max_keys() -> usize {
    50
}

fn default_max_name_len() -> usize {
    100
}

impl Default for ValidationLimits {
    fn default() -> Self {
        ValidationLimits {
            max_bytes: default_max_bytes(),
            max_string_len: default_max_string_len(),
            max_depth: default_max_depth(),
            max_keys: default_max_keys(),
            max_name_len: default_max_name_len(),
        }
    }
}

/// Default validator: limits, key denylist and PII value patterns.
#[derive(Clone, Default)]
pub struct DefaultValidator {
    limits: ValidationLimits,
    detector: PiiDetector,
}

impl DefaultValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        DefaultValidator {
            limits,
            detector: PiiDetector::new(),
        }
    }

    pub fn with_detector(mut self, detector: PiiDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    fn check_value(&self, path: &str, value: &Value, depth: usize) -> Result<(), ValidationIssue> {
        match value {
            Value::String(s) => {
                let len = s.chars().count();
                if len > self.limits.max_string_len {
                    return Err(ValidationIssue::StringTooLong {
                        path: path.to_string(),
                        len,
                        max: self.limits.max_string_len,
                    });
                }
                if let Some(kind) = self.detector.detect(s) {
                    return Err(ValidationIssue::PiiDetected {
                        path: path.to_string(),
                        kind,
                    });
                }
                Ok(())
            }
            Value::Array(items) => {
                self.check_depth(path, depth + 1)?;
                for (i, item) in items.iter().enumerate() {
                    self.check_value(&format!("{}[{}]", path, i), item, depth + 1)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                self.check_depth(path, depth + 1)?;
                self.check_map(Some(path), map, depth + 1)
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }

    fn check_depth(&self, path: &str, depth: usize) -> Result<(), ValidationIssue> {
        if depth > self.limits.max_depth {
            return Err(ValidationIssue::TooDeep {
                path: path.to_string(),
                depth,
                max: self.limits.max_depth,
            });
        }
        Ok(())
    }

    fn check_map(
        &self,
        prefix: Option<&str>,
        map: &Properties,
        depth: usize,
    ) -> Result<(), ValidationIssue> {
        for (key, value) in map {
            if is_denied_key(key) {
                return Err(ValidationIssue::DeniedKey { key: key.clone() });
            }
            let path = match prefix {
                Some(p) => format!("{}.{}", p, key),
                None => key.clone(),
            };
            self.check_value(&path, value, depth)?;
        }
        Ok(())
    }

    fn check(&self, properties: &Properties) -> Result<(), ValidationIssue> {
        if properties.len() > self.limits.max_keys {
            return Err(ValidationIssue::TooManyKeys {
                count: properties.len(),
                max: self.limits.max_keys,
            });
        }

        let bytes = serde_json::to_vec(properties)
            .map_err(|e| ValidationIssue::Serialization(e.to_string()))?
            .len();
        if bytes > self.limits.max_bytes {
            return Err(ValidationIssue::TooLarge {
                bytes,
                max: self.limits.max_bytes,
            });
        }

        self.check_map(None, properties, 1)
    }
}

impl PropertyValidator for DefaultValidator {
    fn validate(&self, properties: &Properties) -> ValidationReport {
        match self.check(properties) {
            Ok(()) => ValidationReport::ok(),
            Err(issue) => ValidationReport::reject(issue),
        }
    }

    fn validate_name(&self, name: &str) -> ValidationReport {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return ValidationReport::reject(ValidationIssue::InvalidName("empty".to_string()));
        }
        if trimmed.chars().count() > self.limits.max_name_len {
            return ValidationReport::reject(ValidationIssue::InvalidName(format!(
                "longer than {} chars",
                self.limits.max_name_len
            )));
        }
        if let Some(kind) = self.detector.detect(trimmed) {
            return ValidationReport::reject(ValidationIssue::InvalidName(format!(
                "contains {}",
                kind
            )));
        }
        ValidationReport::ok()
    }
}
