//! In-flight batch tracking.
//!
//! A batch handed to the dispatcher is marked in flight until it is resolved
//! by `mark_sent` / `mark_failed`. While marked, no other batch containing
//! any of its events may be handed out. Each marker carries an absolute
//! expiry that is checked lazily on the next queue access, so a dispatcher
//! that vanished mid-send cannot wedge the queue forever.

use std::collections::{HashMap, HashSet};
use std::fmt;

use sha2::{Digest, Sha256};

use tq_common::{EventId, Millis};

/// Deterministic identity of a batch: a hash of its sorted event ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey(String);

impl BatchKey {
    pub fn for_ids<'a, I>(ids: I) -> Self
    where
        I: IntoIterator<Item = &'a EventId>,
    {
        let mut sorted: Vec<&str> = ids.into_iter().map(EventId::as_str).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        for id in sorted {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        BatchKey(hex::encode(&digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct InFlightBatch {
    ids: HashSet<EventId>,
    expires_at: Millis,
}

/// Set of unresolved batches.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    batches: HashMap<BatchKey, InFlightBatch>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop markers whose safety deadline has passed. Returns the keys dropped.
    pub fn expire(&mut self, now: Millis) -> Vec<BatchKey> {
        let expired: Vec<BatchKey> = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.batches.remove(key);
        }
        expired
    }

    /// True if any of `ids` belongs to an unresolved batch.
    pub fn overlaps(&self, ids: &[EventId]) -> bool {
        ids.iter().any(|id| self.is_in_flight(id))
    }

    pub fn is_in_flight(&self, id: &EventId) -> bool {
        self.batches.values().any(|batch| batch.ids.contains(id))
    }

    /// Mark a batch in flight. Refuses on any overlap with an unresolved batch.
    pub fn begin(&mut self, ids: &[EventId], expires_at: Millis) -> Option<BatchKey> {
        if ids.is_empty() || self.overlaps(ids) {
            return None;
        }
        let key = BatchKey::for_ids(ids);
        self.batches.insert(
            key.clone(),
            InFlightBatch {
                ids: ids.iter().cloned().collect(),
                expires_at,
            },
        );
        Some(key)
    }

    /// Resolve every batch that contains any of `ids`. Returns how many were cleared.
    pub fn resolve(&mut self, ids: &[EventId]) -> usize {
        let lookup: HashSet<&EventId> = ids.iter().collect();
        let before = self.batches.len();
        self.batches
            .retain(|_, batch| !batch.ids.iter().any(|id| lookup.contains(id)));
        before - self.batches.len()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<EventId> {
        raw.iter().map(|s| EventId::from(*s)).collect()
    }

    #[test]
    fn test_batch_key_is_order_independent() {
        let a = BatchKey::for_ids(&ids(&["x", "y", "z"]));
        let b = BatchKey::for_ids(&ids(&["z", "x", "y"]));
        let c = BatchKey::for_ids(&ids(&["x", "y"]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 24);
    }

    #[test]
    fn test_begin_rejects_overlap() {
        let mut tracker = InFlightTracker::new();
        assert!(tracker.begin(&ids(&["a", "b"]), 100).is_some());
        assert!(tracker.begin(&ids(&["b", "c"]), 100).is_none());
        assert!(tracker.begin(&ids(&["c", "d"]), 100).is_some());
        assert_eq!(tracker.len(), 2);
        assert!(tracker.begin(&[], 100).is_none());
    }

    #[test]
    fn test_resolve_clears_intersecting_batches() {
        let mut tracker = InFlightTracker::new();
        tracker.begin(&ids(&["a", "b"]), 100);
        tracker.begin(&ids(&["c"]), 100);
        assert_eq!(tracker.resolve(&ids(&["b"])), 1);
        assert!(!tracker.is_in_flight(&EventId::from("a")));
        assert!(tracker.is_in_flight(&EventId::from("c")));
    }

    #[test]
    fn test_expire_uses_deadline() {
        let mut tracker = InFlightTracker::new();
        tracker.begin(&ids(&["a"]), 100);
        tracker.begin(&ids(&["b"]), 200);
        assert!(tracker.expire(99).is_empty());
        assert_eq!(tracker.expire(100).len(), 1);
        assert!(tracker.is_in_flight(&EventId::from("b")));
        assert_eq!(tracker.expire(1_000).len(), 1);
        assert!(tracker.is_empty());
    }
}
