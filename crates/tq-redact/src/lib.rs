//! PII detection and property validation for telq.
//!
//! Event properties pass through a [`PropertyValidator`] before an event is
//! built. The pipeline treats the validator as opaque and authoritative: a
//! rejected property map means the event is silently dropped.
//!
//! # Key Features
//!
//! - **Key denylist**: property names such as `email`, `phone_number` or
//!   `password` are rejected regardless of their value.
//! - **Value patterns**: emails, SSN-like numbers, Luhn-valid card numbers,
//!   phone numbers and bearer credentials are detected with regexes.
//! - **Shape limits**: serialized size, key count, string length and
//!   nesting depth are bounded.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use tq_redact::{DefaultValidator, PropertyValidator};
//!
//! let validator = DefaultValidator::default();
//! let props = json!({ "screen": "settings" }).as_object().cloned().unwrap();
//! assert!(validator.validate(&props).valid);
//!
//! let leaky = json!({ "note": "mail me at jane@example.com" }).as_object().cloned().unwrap();
//! assert!(!validator.validate(&leaky).valid);
//! ```

pub mod detect;
pub mod validate;

pub use detect::{is_denied_key, PiiDetector, PiiType};
pub use validate::{
    DefaultValidator, PropertyValidator, ValidationIssue, ValidationLimits, ValidationReport,
};
