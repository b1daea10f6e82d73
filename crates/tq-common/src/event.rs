//! Event records and their queue metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Millis;
use crate::id::{EventId, SessionId};

/// Event property map (flat-ish key/value, validated before admission).
pub type Properties = serde_json::Map<String, Value>;

/// An immutable record of something that happened.
///
/// Fields are private: once built, an event is only ever read. Sinks receive
/// `&[Event]` and cannot alter what the queue persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    name: String,
    timestamp: Millis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    session_id: SessionId,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    context: Value,
}

impl Event {
    /// Start building an event. The `with_*` methods consume `self`, so an
    /// event can only be shaped before it is handed to anyone else.
    pub fn new(id: EventId, name: impl Into<String>, timestamp: Millis, session_id: SessionId) -> Self {
        Event {
            id,
            name: name.into(),
            timestamp,
            user_id: None,
            session_id,
            properties: Properties::new(),
            context: Value::Null,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> Millis {
        self.timestamp
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn context(&self) -> &Value {
        &self.context
    }
}

/// An event plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: Event,

    /// When the event entered the queue.
    pub queued_at: Millis,

    /// Delivery attempts so far, cumulative over the event's lifetime.
    #[serde(default)]
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Millis>,
}

impl QueuedEvent {
    pub fn new(event: Event, queued_at: Millis) -> Self {
        QueuedEvent {
            event,
            queued_at,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }

    pub fn id(&self) -> &EventId {
        self.event.id()
    }

    /// Record a failed delivery attempt.
    pub fn record_attempt(&mut self, now: Millis) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
    }

    /// Age measured from the event's own timestamp.
    pub fn age_ms(&self, now: Millis) -> i64 {
        now.saturating_sub(self.event.timestamp())
    }

    pub fn is_expired(&self, now: Millis, max_age_ms: i64) -> bool {
        self.age_ms(now) >= max_age_ms
    }
}
