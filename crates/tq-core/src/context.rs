//! Device/app context attached verbatim to each event.

use std::fmt;

use serde_json::Value;

/// Supplies the opaque context snapshot for a new event.
pub trait ContextProvider: Send + Sync + fmt::Debug {
    fn snapshot(&self) -> Value;
}

/// Attaches no context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

impl ContextProvider for NoContext {
    fn snapshot(&self) -> Value {
        Value::Null
    }
}

/// Attaches the same fixed value to every event.
#[derive(Debug, Clone)]
pub struct StaticContext(Value);

impl StaticContext {
    pub fn new(value: Value) -> Self {
        StaticContext(value)
    }
}

impl ContextProvider for StaticContext {
    fn snapshot(&self) -> Value {
        self.0.clone()
    }
}
