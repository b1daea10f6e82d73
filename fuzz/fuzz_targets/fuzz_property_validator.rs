//! Fuzz target for event property validation.
//!
//! Arbitrary JSON objects and event names go through the default
//! validator without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tq_redact::{DefaultValidator, PropertyValidator};

fuzz_target!(|data: &str| {
    let validator = DefaultValidator::default();
    let _ = validator.validate_name(data);
    if let Ok(serde_json::Value::Object(properties)) = serde_json::from_str(data) {
        let _ = validator.validate(&properties);
    }
});
