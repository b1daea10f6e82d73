//! Retention passes over the in-memory copy of the queue.
//!
//! Queue order is insertion order, so "oldest" always means the front of
//! the vector. Every pass returns how many records it removed so the caller
//! can log it; nothing is dropped silently.

use tq_common::{Millis, QueuedEvent};

use crate::{AGGRESSIVE_TARGET_PERCENT, EVICTION_BATCH_PERCENT, EVICTION_THRESHOLD_PERCENT};

/// Remove events older than `max_age_ms`.
pub fn purge_expired(events: &mut Vec<QueuedEvent>, now: Millis, max_age_ms: i64) -> usize {
    let before = events.len();
    events.retain(|q| !q.is_expired(now, max_age_ms));
    before - events.len()
}

/// How many of the oldest events to evict before appending one more.
///
/// At or above 90% of `max_queue_size` the oldest 10% (at least one) go.
/// A queue already over capacity (e.g. after the limit was lowered) is cut
/// back to that level too.
pub fn eviction_count(len: usize, max_queue_size: usize) -> usize {
    if max_queue_size == 0 {
        return len;
    }
    if len * 100 < max_queue_size * EVICTION_THRESHOLD_PERCENT {
        return 0;
    }
    let batch = (max_queue_size * EVICTION_BATCH_PERCENT / 100).max(1);
    let overflow = len.saturating_sub(max_queue_size);
    (batch + overflow).min(len)
}

/// Drop the `count` oldest events.
pub fn evict_oldest(events: &mut Vec<QueuedEvent>, count: usize) -> usize {
    let count = count.min(events.len());
    events.drain(..count);
    count
}

/// Keep only the newest `target_len` events.
pub fn shrink_to(events: &mut Vec<QueuedEvent>, target_len: usize) -> usize {
    let excess = events.len().saturating_sub(target_len);
    evict_oldest(events, excess)
}

/// Length the queue is cut to after a quota failure (70% of capacity, at least one).
pub fn aggressive_target(max_queue_size: usize) -> usize {
    (max_queue_size * AGGRESSIVE_TARGET_PERCENT / 100).max(1)
}
