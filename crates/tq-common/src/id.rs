//! Event and session identity types.
//!
//! Event ids must stay unique across process restarts and across devices,
//! so they combine the wall-clock time, a per-generator monotonic counter,
//! and random bits. Session ids are regenerated on every identity change.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Unique identifier of a single event.
///
/// Format: `evt-<millis hex>-<counter hex>-<random base32>`
/// Example: `evt-19b7e1c4a00-00002a-k3q7x2mb`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Wrap an existing id string (e.g. one loaded from storage).
    pub fn from_string(id: impl Into<String>) -> Self {
        EventId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        EventId(id.to_string())
    }
}

/// Session identifier attached to every event.
///
/// Format: `ses-YYYYMMDD-HHMMSS-XXXXXXXX`
/// Example: `ses-20260115-143022-a7xq2kmd`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session ID stamped with the given time.
    pub fn generate(now: DateTime<Utc>) -> Self {
        SessionId(format!(
            "ses-{}-{}-{}",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            random_base32(8)
        ))
    }

    /// Wrap an existing id string (e.g. one loaded from storage).
    pub fn from_string(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    /// Parse a generated session ID, rejecting anything not in the canonical format.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 28 || !s.starts_with("ses-") {
            return None;
        }
        let bytes = s.as_bytes();
        if bytes.get(12) != Some(&b'-') || bytes.get(19) != Some(&b'-') {
            return None;
        }
        let date = &s[4..12];
        let time = &s[13..19];
        let suffix = &s[20..28];
        if !date.chars().all(|c| c.is_ascii_digit()) || !time.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }
        if !suffix.bytes().all(|c| BASE32_ALPHABET.contains(&c)) {
            return None;
        }
        Some(SessionId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stateful generator for event and session ids.
///
/// One generator is owned by the orchestrator; the counter guarantees that
/// two ids minted within the same millisecond still differ even if the
/// random component collides.
#[derive(Debug)]
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        IdGenerator {
            clock,
            counter: AtomicU64::new(0),
        }
    }

    /// Mint the next event id.
    pub fn next(&self) -> EventId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let now = self.clock.now_ms().max(0);
        EventId(format!("evt-{:x}-{:06x}-{}", now, seq, random_base32(8)))
    }

    /// Mint a new session id stamped with the generator's clock.
    pub fn session(&self) -> SessionId {
        let now = DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms()).unwrap_or_default();
        SessionId::generate(now)
    }
}

fn random_base32(len: usize) -> String {
    let mut bits: u64 = rand::random();
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        out.push(BASE32_ALPHABET[(bits & 0x1F) as usize] as char);
        bits >>= 5;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;

    #[test]
    fn test_session_id_format() {
        let sid = SessionId::generate(Utc::now());
        assert!(sid.as_str().starts_with("ses-"));
        assert_eq!(sid.as_str().len(), 28);
        assert!(SessionId::parse(sid.as_str()).is_some());
    }

    #[test]
    fn test_session_id_parse_rejects_garbage() {
        assert!(SessionId::parse("ses-2026").is_none());
        assert!(SessionId::parse("pt-20260115-143022-a7xq2kmd1").is_none());
        assert!(SessionId::parse("ses-2026011a-143022-a7xq2kmd").is_none());
        assert!(SessionId::parse("ses-20260115-143022-A7XQ2KMD").is_none());
    }

    #[test]
    fn test_event_ids_unique_within_same_millisecond() {
        let clock = Arc::new(ManualClock::new(42));
        let ids = IdGenerator::new(clock);
        let seen: HashSet<_> = (0..10_000).map(|_| ids.next()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_event_id_embeds_time_and_counter() {
        let clock = Arc::new(ManualClock::new(0x1234));
        let ids = IdGenerator::new(clock);
        let first = ids.next();
        let second = ids.next();
        assert!(first.as_str().starts_with("evt-1234-000000-"));
        assert!(second.as_str().starts_with("evt-1234-000001-"));
    }

    #[test]
    fn test_generator_session_uses_clock() {
        let clock = Arc::new(ManualClock::new(1_768_487_422_000)); // 2026-01-15T14:30:22Z
        let ids = IdGenerator::new(clock);
        let sid = ids.session();
        assert!(sid.as_str().starts_with("ses-20260115-143022-"));
    }

    #[test]
    fn test_empty_ids() {
        assert!(EventId::from_string("  ").is_empty());
        assert!(!EventId::from("evt-1").is_empty());
        assert!(SessionId::from_string("").is_empty());
    }
}
