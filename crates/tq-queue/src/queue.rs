//! The durable event queue.
//!
//! [`DurableQueue`] is the only component that touches the persisted
//! store. Every operation takes one async mutex for its whole
//! read-modify-write cycle, including the storage I/O, so concurrent callers
//! never interleave. The lock is never held across a sink call: the
//! dispatcher takes a batch, releases the queue, sends, and comes back with
//! `mark_sent` / `mark_failed`.
//!
//! Writes follow backup-before-overwrite: the current primary document is
//! copied to the backup slot (when it still decodes) before the primary is
//! replaced. Loads fall back from primary to backup to empty.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tq_common::{Clock, Event, EventId, Millis, QueuedEvent};
use tq_config::PipelineConfig;

use crate::document::{decode_queue, encode_queue, DecodeError, DecodedQueue, QueueStats};
use crate::inflight::InFlightTracker;
use crate::retention::{
    aggressive_target, evict_oldest, eviction_count, purge_expired, shrink_to,
};
use crate::storage::{Slot, StorageBackend, StorageError};

/// Admission check consulted under the queue lock on every enqueue.
///
/// Checking inside the lock means a write can never land after a
/// concurrent revocation has cleared the store.
pub trait AdmissionGate: Send + Sync + fmt::Debug {
    fn admits(&self) -> bool;
}

/// Queue limits derived from [`PipelineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_event_age_ms: i64,
    pub max_serialized_bytes: usize,
    pub in_flight_timeout_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for QueueConfig {
    fn from(config: &PipelineConfig) -> Self {
        QueueConfig {
            max_queue_size: config.max_queue_size,
            max_event_age_ms: clamp_ms(config.max_event_age_ms),
            max_serialized_bytes: config.max_serialized_bytes,
            in_flight_timeout_ms: clamp_ms(config.in_flight_timeout_ms),
        }
    }
}

fn clamp_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Errors from queue mutations other than enqueue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode queue document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_quota(&self) -> bool {
        matches!(self, QueueError::Storage(e) if e.is_quota())
    }
}

/// Why an enqueue did not store its event.
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("consent not granted")]
    ConsentDenied,

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("failed to encode queue document: {0}")]
    Encode(serde_json::Error),
}

impl From<QueueError> for EnqueueError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Storage(e) => EnqueueError::Storage(e),
            QueueError::Encode(e) => EnqueueError::Encode(e),
        }
    }
}

/// Result of a successful enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; `evicted` oldest events were dropped to make room.
    Stored { evicted: usize },
    /// Appended after a quota failure forced an aggressive cleanup.
    StoredAfterCleanup { evicted: usize },
    /// An event with the same id is already queued.
    Duplicate,
    /// The quota retry failed too; the new event was discarded.
    Dropped,
}

impl EnqueueOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            EnqueueOutcome::Stored { .. } | EnqueueOutcome::StoredAfterCleanup { .. }
        )
    }
}

/// What `mark_failed` did with the events of a failed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureSummary {
    /// Events kept for another attempt.
    pub retained: usize,
    /// Events that reached the attempt ceiling and were removed.
    pub dropped: usize,
}

#[derive(Serialize, Deserialize)]
struct PurgeMarker {
    requested_at: Millis,
}

#[derive(Error, Debug)]
enum Unreadable {
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Corrupt(#[from] DecodeError),
}

#[derive(Debug, Default)]
struct QueueState {
    in_flight: InFlightTracker,
}

/// Persistent FIFO of pending events.
pub struct DurableQueue {
    store: Arc<dyn StorageBackend>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    gate: Option<Arc<dyn AdmissionGate>>,
    state: Mutex<QueueState>,
}

impl fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableQueue")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

impl DurableQueue {
    pub fn new(store: Arc<dyn StorageBackend>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        DurableQueue {
            store,
            config,
            clock,
            gate: None,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Consult `gate` before every enqueue and batch selection.
    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn admits(&self) -> bool {
        self.gate.as_ref().is_none_or(|g| g.admits())
    }

    /// Load (recovering from the backup if needed), purge expired events and
    /// enforce capacity. Returns the number of events retained.
    pub async fn initialize(&self) -> Result<usize, QueueError> {
        let _guard = self.state.lock().await;
        let now = self.clock.now_ms();
        let mut events = self.load_events().await;

        let expired = purge_expired(&mut events, now, self.config.max_event_age_ms);
        let over = shrink_to(&mut events, self.config.max_queue_size);
        if expired + over > 0 {
            info!(expired, evicted = over, "Queue retention applied at startup");
            self.persist(&events).await?;
        }

        let mut stats = self.load_stats().await;
        stats.queued = events.len();
        self.save_stats(&stats).await;

        info!(events = events.len(), "Queue initialized");
        Ok(events.len())
    }

    /// Append `event` at the tail.
    ///
    /// At 90% fill the oldest 10% is evicted first. A quota failure triggers
    /// one aggressive cleanup (expired purge, shrink to 70%) and a single
    /// retry; if that fails too the new event is discarded and
    /// `Ok(EnqueueOutcome::Dropped)` is returned.
    pub async fn enqueue(&self, event: Event) -> Result<EnqueueOutcome, EnqueueError> {
        let _guard = self.state.lock().await;
        if !self.admits() {
            return Err(EnqueueError::ConsentDenied);
        }

        let now = self.clock.now_ms();
        let mut events = self.load_events().await;
        if events.iter().any(|q| q.id() == event.id()) {
            debug!(id = %event.id(), "Duplicate event id, not queued");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let mut evicted = purge_expired(&mut events, now, self.config.max_event_age_ms);
        let over = eviction_count(events.len(), self.config.max_queue_size);
        if over > 0 {
            evicted += evict_oldest(&mut events, over);
            debug!(evicted = over, "Capacity eviction");
        }

        let id = event.id().clone();
        events.push(QueuedEvent::new(event, now));
        match self.persist(&events).await {
            Ok(()) => return Ok(EnqueueOutcome::Stored { evicted }),
            Err(e) if e.is_quota() => {
                warn!(error = %e, events = events.len(), "Queue write hit quota, cleaning up");
            }
            Err(e) => return Err(e.into()),
        }

        // One aggressive pass, one retry.
        let Some(new_event) = events.pop() else {
            return Ok(EnqueueOutcome::Dropped);
        };
        evicted += purge_expired(&mut events, now, self.config.max_event_age_ms);
        let target = aggressive_target(self.config.max_queue_size).saturating_sub(1);
        evicted += shrink_to(&mut events, target);
        events.push(new_event);

        match self.persist(&events).await {
            Ok(()) => {
                info!(evicted, "Queue write succeeded after aggressive cleanup");
                Ok(EnqueueOutcome::StoredAfterCleanup { evicted })
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Queue write failed after cleanup, event dropped");
                Ok(EnqueueOutcome::Dropped)
            }
        }
    }

    /// Select up to `max` of the oldest events and mark them in flight.
    ///
    /// Events stay in the store until resolved. Returns an empty batch if
    /// the selection overlaps an unresolved batch, if the gate is closed,
    /// or if nothing is pending.
    pub async fn dequeue_batch(&self, max: usize) -> Vec<Event> {
        let mut state = self.state.lock().await;
        if max == 0 || !self.admits() {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        for key in state.in_flight.expire(now) {
            warn!(batch_key = %key, "In-flight batch expired without resolution");
        }

        let mut events = self.load_events().await;
        let expired = purge_expired(&mut events, now, self.config.max_event_age_ms);
        if expired > 0 {
            debug!(expired, "Purged expired events before batch selection");
            if let Err(e) = self.persist(&events).await {
                warn!(error = %e, "Failed to persist expiry purge");
            }
        }

        let batch: Vec<Event> = events.iter().take(max).map(|q| q.event.clone()).collect();
        if batch.is_empty() {
            return batch;
        }

        let ids: Vec<EventId> = batch.iter().map(|e| e.id().clone()).collect();
        let expires_at = now.saturating_add(self.config.in_flight_timeout_ms);
        match state.in_flight.begin(&ids, expires_at) {
            Some(key) => {
                debug!(batch_key = %key, events = ids.len(), "Batch marked in flight");
                batch
            }
            None => {
                debug!(events = ids.len(), "Selection overlaps an in-flight batch");
                Vec::new()
            }
        }
    }

    /// Remove delivered events and record the successful sync.
    pub async fn mark_sent(&self, ids: &[EventId]) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.resolve(ids);

        let now = self.clock.now_ms();
        let lookup: HashSet<&EventId> = ids.iter().collect();
        let mut events = self.load_events().await;
        let before = events.len();
        events.retain(|q| !lookup.contains(q.id()));
        let removed = before - events.len();
        if removed > 0 {
            self.persist(&events).await?;
        }

        let mut stats = self.load_stats().await;
        stats.queued = events.len();
        stats.last_sync_time = Some(now);
        self.save_stats(&stats).await;

        debug!(removed, remaining = events.len(), "Batch marked sent");
        Ok(removed)
    }

    /// Count a failed attempt against each event of a batch.
    ///
    /// Attempts accumulate over an event's lifetime; an event whose count
    /// reaches `max_attempts` is removed for good.
    pub async fn mark_failed(
        &self,
        ids: &[EventId],
        max_attempts: u32,
    ) -> Result<FailureSummary, QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.resolve(ids);

        let now = self.clock.now_ms();
        let lookup: HashSet<&EventId> = ids.iter().collect();
        let mut events = self.load_events().await;
        let mut summary = FailureSummary::default();

        events.retain_mut(|q| {
            if !lookup.contains(q.id()) {
                return true;
            }
            q.record_attempt(now);
            if q.attempt_count >= max_attempts {
                summary.dropped += 1;
                false
            } else {
                summary.retained += 1;
                true
            }
        });

        if summary.retained + summary.dropped > 0 {
            self.persist(&events).await?;
        }
        if summary.dropped > 0 {
            warn!(
                dropped = summary.dropped,
                max_attempts, "Events dropped after exhausting delivery attempts"
            );
        }

        let mut stats = self.load_stats().await;
        stats.queued = events.len();
        stats.failed_syncs += 1;
        stats.last_failed_sync_time = Some(now);
        self.save_stats(&stats).await;

        Ok(summary)
    }

    /// Empty the store, including the backup slot.
    ///
    /// A slot that cannot be removed is overwritten with an empty document
    /// instead. Only when both fail for a slot is an error returned.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.clear();

        let now = self.clock.now_ms();
        let empty = encode_queue(&[], now)?;
        let mut first_error = None;
        for slot in [Slot::Backup, Slot::Primary] {
            if let Err(e) = self.store.remove(slot).await {
                warn!(slot = %slot, error = %e, "Remove failed, overwriting with empty document");
                if let Err(e) = self.store.write(slot, &empty).await {
                    warn!(slot = %slot, error = %e, "Failed to blank slot");
                    first_error.get_or_insert(e);
                }
            }
        }

        let mut stats = self.load_stats().await;
        stats.queued = 0;
        self.save_stats(&stats).await;

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!("Queue cleared");
                Ok(())
            }
        }
    }

    /// Snapshot of every queued event in delivery order.
    pub async fn get_all_events(&self) -> Vec<QueuedEvent> {
        let _guard = self.state.lock().await;
        self.load_events().await
    }

    /// Delete every queued event attributed to `user_id`.
    ///
    /// The backup slot is rewritten with the same contents so erased events
    /// cannot be recovered from it later.
    pub async fn remove_events_for_user(&self, user_id: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let mut events = self.load_events().await;
        let mut erased = Vec::new();
        events.retain(|q| {
            if q.event.user_id() == Some(user_id) {
                erased.push(q.id().clone());
                false
            } else {
                true
            }
        });
        if erased.is_empty() {
            return Ok(0);
        }

        state.in_flight.resolve(&erased);
        let doc = encode_queue(&events, self.clock.now_ms())?;
        self.store.write(Slot::Primary, &doc).await?;
        if let Err(e) = self.store.write(Slot::Backup, &doc).await {
            warn!(error = %e, "Failed to rewrite backup after erasure, removing it");
            self.store.remove(Slot::Backup).await?;
        }

        let mut stats = self.load_stats().await;
        stats.queued = events.len();
        self.save_stats(&stats).await;

        info!(removed = erased.len(), "Erased events for user");
        Ok(erased.len())
    }

    /// Persisted stats with the live queue length.
    pub async fn get_stats(&self) -> QueueStats {
        let _guard = self.state.lock().await;
        let mut stats = self.load_stats().await;
        stats.queued = self.load_events().await.len();
        stats
    }

    pub async fn len(&self) -> usize {
        self.get_all_events().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of unresolved in-flight batches (expired markers included
    /// until the next batch selection drops them).
    pub async fn in_flight_batches(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Record that a revocation purge has started.
    pub async fn mark_purge_pending(&self) -> Result<(), QueueError> {
        let _guard = self.state.lock().await;
        let marker = serde_json::to_string(&PurgeMarker {
            requested_at: self.clock.now_ms(),
        })?;
        self.store.write(Slot::PurgeMarker, &marker).await?;
        Ok(())
    }

    /// True while a revocation purge is recorded as unfinished.
    ///
    /// An unreadable marker counts as pending.
    pub async fn purge_pending(&self) -> bool {
        let _guard = self.state.lock().await;
        match self.store.read(Slot::PurgeMarker).await {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                warn!(error = %e, "Could not read purge marker, assuming pending");
                true
            }
        }
    }

    pub async fn clear_purge_marker(&self) -> Result<(), QueueError> {
        let _guard = self.state.lock().await;
        self.store.remove(Slot::PurgeMarker).await?;
        Ok(())
    }

    async fn read_document(&self, slot: Slot) -> Result<Option<DecodedQueue>, Unreadable> {
        match self.store.read(slot).await? {
            Some(raw) => Ok(Some(decode_queue(&raw)?)),
            None => Ok(None),
        }
    }

    /// Primary, then backup (repairing the primary), then empty.
    ///
    /// A missing primary is an empty queue; the backup is only consulted
    /// when the primary exists but cannot be read or decoded.
    async fn load_events(&self) -> Vec<QueuedEvent> {
        let primary_error = match self.read_document(Slot::Primary).await {
            Ok(Some(decoded)) => {
                if decoded.dropped > 0 {
                    warn!(dropped = decoded.dropped, "Dropped malformed queue records");
                }
                return decoded.events;
            }
            Ok(None) => return Vec::new(),
            Err(e) => e,
        };
        warn!(error = %primary_error, "Primary queue unreadable, trying backup");

        let recovered = match self.read_document(Slot::Backup).await {
            Ok(Some(decoded)) => {
                info!(
                    events = decoded.events.len(),
                    dropped = decoded.dropped,
                    "Recovered queue from backup"
                );
                decoded.events
            }
            Ok(None) => {
                warn!("No backup available, resetting queue");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Backup unreadable too, resetting queue");
                Vec::new()
            }
        };

        match encode_queue(&recovered, self.clock.now_ms()) {
            Ok(doc) => {
                if let Err(e) = self.store.write(Slot::Primary, &doc).await {
                    warn!(error = %e, "Failed to repair primary queue");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode recovered queue"),
        }
        recovered
    }

    /// Copy the current primary to the backup, then replace the primary.
    async fn persist(&self, events: &[QueuedEvent]) -> Result<(), QueueError> {
        let doc = encode_queue(events, self.clock.now_ms())?;
        if doc.len() > self.config.max_serialized_bytes {
            return Err(StorageError::QuotaExceeded {
                slot: Slot::Primary.key(),
                bytes: doc.len(),
                max: self.config.max_serialized_bytes,
            }
            .into());
        }

        match self.store.read(Slot::Primary).await {
            Ok(Some(current)) if decode_queue(&current).is_ok() => {
                if let Err(e) = self.store.write(Slot::Backup, &current).await {
                    warn!(error = %e, "Backup write failed, continuing with primary");
                }
            }
            Ok(Some(_)) => debug!("Current primary is corrupt, not copied to backup"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read primary for backup"),
        }

        self.store.write(Slot::Primary, &doc).await?;
        Ok(())
    }

    async fn load_stats(&self) -> QueueStats {
        match self.store.read(Slot::Stats).await {
            Ok(Some(raw)) => QueueStats::decode(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Stats document corrupt, resetting");
                QueueStats::default()
            }),
            Ok(None) => QueueStats::default(),
            Err(e) => {
                warn!(error = %e, "Could not read stats");
                QueueStats::default()
            }
        }
    }

    async fn save_stats(&self, stats: &QueueStats) {
        let result = match stats.encode() {
            Ok(raw) => self.store.write(Slot::Stats, &raw).await.map_err(QueueError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to save queue stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Fault, MemoryStorage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tq_common::{ManualClock, SessionId};

    const START: Millis = 1_767_225_600_000;

    struct Harness {
        store: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        queue: DurableQueue,
    }

    fn harness(config: QueueConfig) -> Harness {
        let store = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(START));
        let queue = DurableQueue::new(store.clone(), config, clock.clone());
        Harness { store, clock, queue }
    }

    fn event(id: &str, ts: Millis) -> Event {
        Event::new(EventId::from(id), "screen_view", ts, SessionId::from_string("ses-test"))
    }

    fn ids(events: &[Event]) -> Vec<EventId> {
        events.iter().map(|e| e.id().clone()).collect()
    }

    #[tokio::test]
    async fn test_enqueue_then_dequeue_in_order() {
        let h = harness(QueueConfig::default());
        for id in ["a", "b", "c"] {
            let outcome = h.queue.enqueue(event(id, START)).await.unwrap();
            assert_eq!(outcome, EnqueueOutcome::Stored { evicted: 0 });
        }
        let batch = h.queue.dequeue_batch(10).await;
        let got: Vec<_> = batch.iter().map(|e| e.id().as_str()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
        // Still stored until resolved.
        assert_eq!(h.queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_id_not_stored() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        let outcome = h.queue.enqueue(event("a", START)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Duplicate);
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction_drops_oldest_tenth() {
        let config = QueueConfig {
            max_queue_size: 10,
            ..QueueConfig::default()
        };
        let h = harness(config);
        for i in 0..9 {
            h.queue.enqueue(event(&format!("e{}", i), START)).await.unwrap();
        }
        let outcome = h.queue.enqueue(event("e9", START)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Stored { evicted: 1 });
        let all = h.queue.get_all_events().await;
        assert_eq!(all.len(), 9);
        assert_eq!(all[0].id().as_str(), "e1");
        assert_eq!(all[8].id().as_str(), "e9");
    }

    #[tokio::test]
    async fn test_backup_holds_previous_primary() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        assert!(h.store.get_raw(Slot::Backup).is_none());
        h.queue.enqueue(event("b", START)).await.unwrap();

        let backup = decode_queue(&h.store.get_raw(Slot::Backup).unwrap()).unwrap();
        assert_eq!(backup.events.len(), 1);
        assert_eq!(backup.events[0].id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_block_primary() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        h.store.fail_next_writes(Slot::Backup, 1, Fault::Io);
        let outcome = h.queue.enqueue(event("b", START)).await.unwrap();
        assert!(outcome.is_stored());
        assert_eq!(h.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_overlapping_dequeue_returns_empty_until_expiry() {
        let config = QueueConfig {
            in_flight_timeout_ms: 1_000,
            ..QueueConfig::default()
        };
        let h = harness(config);
        h.queue.enqueue(event("a", START)).await.unwrap();

        assert_eq!(h.queue.dequeue_batch(10).await.len(), 1);
        assert!(h.queue.dequeue_batch(10).await.is_empty());

        h.clock.advance_ms(1_000);
        assert_eq!(h.queue.dequeue_batch(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_sent_resolves_and_removes() {
        let h = harness(QueueConfig::default());
        for id in ["a", "b", "c"] {
            h.queue.enqueue(event(id, START)).await.unwrap();
        }
        let batch = h.queue.dequeue_batch(10).await;
        let removed = h.queue.mark_sent(&ids(&batch[..2])).await.unwrap();
        assert_eq!(removed, 2);

        let stats = h.queue.get_stats().await;
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.last_sync_time, Some(START));
        assert_eq!(h.queue.in_flight_batches().await, 0);
        assert_eq!(h.queue.dequeue_batch(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_failed_counts_lifetime_attempts() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();

        for attempt in 1..=2u32 {
            let batch = h.queue.dequeue_batch(10).await;
            let summary = h.queue.mark_failed(&ids(&batch), 3).await.unwrap();
            assert_eq!(summary, FailureSummary { retained: 1, dropped: 0 });
            assert_eq!(h.queue.get_all_events().await[0].attempt_count, attempt);
        }

        let batch = h.queue.dequeue_batch(10).await;
        let summary = h.queue.mark_failed(&ids(&batch), 3).await.unwrap();
        assert_eq!(summary, FailureSummary { retained: 0, dropped: 1 });
        assert!(h.queue.is_empty().await);

        let stats = h.queue.get_stats().await;
        assert_eq!(stats.failed_syncs, 3);
        assert_eq!(stats.last_failed_sync_time, Some(START));
    }

    #[tokio::test]
    async fn test_expired_events_purged_before_selection() {
        let config = QueueConfig {
            max_event_age_ms: 1_000,
            ..QueueConfig::default()
        };
        let h = harness(config);
        h.queue.enqueue(event("old", START)).await.unwrap();
        h.clock.advance_ms(600);
        h.queue.enqueue(event("new", START + 600)).await.unwrap();
        h.clock.advance_ms(500);

        let batch = h.queue.dequeue_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id().as_str(), "new");
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_quota_triggers_cleanup_then_retry() {
        let config = QueueConfig {
            max_queue_size: 10,
            ..QueueConfig::default()
        };
        let h = harness(config);
        for i in 0..8 {
            h.queue.enqueue(event(&format!("e{}", i), START)).await.unwrap();
        }
        h.store.fail_next_writes(Slot::Primary, 1, Fault::Quota);
        let outcome = h.queue.enqueue(event("late", START)).await.unwrap();
        // 8 existing shrink to 6 so the queue lands on 7 (70% of 10).
        assert_eq!(outcome, EnqueueOutcome::StoredAfterCleanup { evicted: 2 });
        let all = h.queue.get_all_events().await;
        assert_eq!(all.len(), 7);
        assert_eq!(all.last().unwrap().id().as_str(), "late");
    }

    #[tokio::test]
    async fn test_quota_retry_failure_drops_event_without_error() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        h.store.fail_next_writes(Slot::Primary, 2, Fault::Quota);
        let outcome = h.queue.enqueue(event("b", START)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Dropped);
        let all = h.queue.get_all_events().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id().as_str(), "a");
    }

    #[tokio::test]
    async fn test_serialized_size_ceiling_is_a_quota_error() {
        let config = QueueConfig {
            max_serialized_bytes: 64,
            ..QueueConfig::default()
        };
        let h = harness(config);
        let outcome = h.queue.enqueue(event("a", START)).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Dropped);
        assert!(h.store.get_raw(Slot::Primary).is_none());
    }

    #[tokio::test]
    async fn test_non_quota_error_propagates() {
        let h = harness(QueueConfig::default());
        h.store.fail_next_writes(Slot::Primary, 1, Fault::Io);
        let err = h.queue.enqueue(event("a", START)).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Storage(_)));
    }

    #[derive(Debug)]
    struct Flag(AtomicBool);

    impl AdmissionGate for Flag {
        fn admits(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_closed_gate_rejects_enqueue_and_selection() {
        let store = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(START));
        let gate = Arc::new(Flag(AtomicBool::new(true)));
        let queue =
            DurableQueue::new(store, QueueConfig::default(), clock).with_gate(gate.clone());

        queue.enqueue(event("a", START)).await.unwrap();
        gate.0.store(false, Ordering::SeqCst);
        assert!(matches!(
            queue.enqueue(event("b", START)).await,
            Err(EnqueueError::ConsentDenied)
        ));
        assert!(queue.dequeue_batch(10).await.is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_primary_recovers_from_backup() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        h.queue.enqueue(event("b", START)).await.unwrap();
        h.queue.enqueue(event("c", START)).await.unwrap();
        // Backup now holds a and b.
        h.store.put_raw(Slot::Primary, "{not json");

        assert_eq!(h.queue.initialize().await.unwrap(), 2);
        let repaired = decode_queue(&h.store.get_raw(Slot::Primary).unwrap()).unwrap();
        let got: Vec<_> = repaired.events.iter().map(|q| q.id().as_str()).collect();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_both_slots_corrupt_resets_to_empty() {
        let h = harness(QueueConfig::default());
        h.store.put_raw(Slot::Primary, "garbage");
        h.store.put_raw(Slot::Backup, "[1,2,3]");
        assert_eq!(h.queue.initialize().await.unwrap(), 0);
        assert!(decode_queue(&h.store.get_raw(Slot::Primary).unwrap())
            .unwrap()
            .events
            .is_empty());
    }

    #[tokio::test]
    async fn test_initialize_enforces_capacity_and_age() {
        let h = harness(QueueConfig::default());
        for i in 0..5 {
            h.queue.enqueue(event(&format!("e{}", i), START)).await.unwrap();
        }
        let config = QueueConfig {
            max_queue_size: 3,
            ..QueueConfig::default()
        };
        let reopened = DurableQueue::new(h.store.clone(), config, h.clock.clone());
        assert_eq!(reopened.initialize().await.unwrap(), 3);
        let all = reopened.get_all_events().await;
        assert_eq!(all[0].id().as_str(), "e2");
    }

    #[tokio::test]
    async fn test_clear_removes_primary_and_backup() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        h.queue.enqueue(event("b", START)).await.unwrap();
        h.queue.dequeue_batch(10).await;

        h.queue.clear().await.unwrap();
        assert!(h.store.get_raw(Slot::Primary).is_none());
        assert!(h.store.get_raw(Slot::Backup).is_none());
        assert_eq!(h.queue.in_flight_batches().await, 0);
        assert_eq!(h.queue.get_stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_clear_falls_back_to_blanking() {
        let h = harness(QueueConfig::default());
        h.queue.enqueue(event("a", START)).await.unwrap();
        h.queue.enqueue(event("b", START)).await.unwrap();
        h.store.fail_next_removes(Slot::Backup, 1);

        h.queue.clear().await.unwrap();
        let backup = decode_queue(&h.store.get_raw(Slot::Backup).unwrap()).unwrap();
        assert!(backup.events.is_empty());
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_events_for_user_scrubs_backup() {
        let h = harness(QueueConfig::default());
        let alice = |id: &str| event(id, START).with_user(Some("alice".to_string()));
        h.queue.enqueue(alice("a1")).await.unwrap();
        h.queue.enqueue(event("anon", START)).await.unwrap();
        h.queue.enqueue(alice("a2")).await.unwrap();

        assert_eq!(h.queue.remove_events_for_user("alice").await.unwrap(), 2);
        assert_eq!(h.queue.remove_events_for_user("alice").await.unwrap(), 0);

        for slot in [Slot::Primary, Slot::Backup] {
            let doc = decode_queue(&h.store.get_raw(slot).unwrap()).unwrap();
            assert_eq!(doc.events.len(), 1, "slot {}", slot);
            assert_eq!(doc.events[0].id().as_str(), "anon");
        }
    }

    #[tokio::test]
    async fn test_purge_marker_lifecycle() {
        let h = harness(QueueConfig::default());
        assert!(!h.queue.purge_pending().await);
        h.queue.mark_purge_pending().await.unwrap();
        assert!(h.queue.purge_pending().await);
        h.queue.clear_purge_marker().await.unwrap();
        assert!(!h.queue.purge_pending().await);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_are_not_lost() {
        let h = harness(QueueConfig::default());
        let queue = Arc::new(h.queue);
        let mut handles = Vec::new();
        for i in 0..32 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(event(&format!("e{}", i), START)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(queue.len().await, 32);
    }
}
