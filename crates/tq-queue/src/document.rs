//! Persisted queue and stats documents.
//!
//! The queue document is a JSON envelope:
//!
//! ```json
//! { "schema_version": "1", "saved_at": 1767225600000, "events": [ ... ] }
//! ```
//!
//! Decoding is corruption tolerant at two levels. A document that is not an
//! object with an `events` array is rejected as a whole (the caller falls
//! back to the backup slot). Inside a well-formed document every record is
//! validated on its own and malformed records are dropped, so one bad entry
//! never costs the rest of the queue.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tq_common::{Millis, QueuedEvent, SCHEMA_VERSION};

/// Why a whole queue document was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Syntax(String),

    #[error("not a queue document: {0}")]
    Shape(&'static str),

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(String),
}

/// Records recovered from a queue document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedQueue {
    /// Valid records in stored order.
    pub events: Vec<QueuedEvent>,

    /// Records dropped as malformed or duplicate.
    pub dropped: usize,
}

#[derive(Serialize)]
struct QueueDocumentRef<'a> {
    schema_version: &'a str,
    saved_at: Millis,
    events: &'a [QueuedEvent],
}

/// Serialize the queue for the primary slot.
pub fn encode_queue(events: &[QueuedEvent], saved_at: Millis) -> Result<String, serde_json::Error> {
    serde_json::to_string(&QueueDocumentRef {
        schema_version: SCHEMA_VERSION,
        saved_at,
        events,
    })
}

/// Parse and validate a queue document.
pub fn decode_queue(raw: &str) -> Result<DecodedQueue, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Syntax(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or(DecodeError::Shape("expected a JSON object"))?;

    if let Some(version) = obj.get("schema_version") {
        match version.as_str() {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => return Err(DecodeError::UnsupportedVersion(v.to_string())),
            None => return Err(DecodeError::Shape("schema_version must be a string")),
        }
    }

    let records = obj
        .get("events")
        .and_then(Value::as_array)
        .ok_or(DecodeError::Shape("missing events array"))?;

    let mut decoded = DecodedQueue::default();
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        match validate_record(record) {
            Some(queued) if seen.insert(queued.id().clone()) => decoded.events.push(queued),
            _ => decoded.dropped += 1,
        }
    }
    Ok(decoded)
}

/// Check one stored record: required fields present and correctly shaped.
fn validate_record(record: &Value) -> Option<QueuedEvent> {
    let queued: QueuedEvent = serde_json::from_value(record.clone()).ok()?;
    let event = &queued.event;
    let well_formed = !event.id().is_empty()
        && !event.name().trim().is_empty()
        && !event.session_id().is_empty()
        && event.timestamp() > 0
        && queued.queued_at > 0
        && event.user_id().is_none_or(|u| !u.is_empty());
    well_formed.then_some(queued)
}

/// Delivery statistics persisted in the stats slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Events currently pending.
    #[serde(default)]
    pub queued: usize,

    /// Failed delivery attempts (batches) since install.
    #[serde(default)]
    pub failed_syncs: u64,

    /// Time of the last successful batch delivery.
    #[serde(default)]
    pub last_sync_time: Option<Millis>,

    /// Time of the last failed batch delivery.
    #[serde(default)]
    pub last_failed_sync_time: Option<Millis>,
}

impl QueueStats {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
