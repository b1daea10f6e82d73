//! Delivery sinks.
//!
//! A [`Sink`] is the opaque destination for batches. The dispatcher wraps
//! every call so a sink that errors, hangs or panics only ever produces a
//! [`SinkError`].

mod jsonl;
mod memory;

pub use jsonl::JsonlFileSink;
pub use memory::MemorySink;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use tq_common::{Event, Properties};

/// Errors a sink call can produce.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The collector could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The collector answered and refused the batch (schema, auth, ...).
    #[error("rejected by collector: {0}")]
    Rejected(String),

    #[error("sink not ready")]
    NotReady,

    #[error("sink call timed out after {0} ms")]
    Timeout(u64),

    #[error("sink panicked: {0}")]
    Panicked(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SinkError {
    /// Connectivity-class failures. Everything else is a sink-side error
    /// that may need intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Network(_) | SinkError::Timeout(_))
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Rejected(format!("unserializable event: {}", err))
    }
}

/// Destination for delivered events.
///
/// Implementations receive events by shared reference and cannot alter
/// them.
#[async_trait]
pub trait Sink: Send + Sync + fmt::Debug {
    async fn initialize(&self) -> Result<(), SinkError>;

    async fn send(&self, events: &[Event]) -> Result<(), SinkError>;

    async fn identify(&self, user_id: &str, traits: &Properties) -> Result<(), SinkError>;

    /// Forget any local identity or buffered state.
    async fn reset(&self) -> Result<(), SinkError>;

    fn is_ready(&self) -> bool;
}
