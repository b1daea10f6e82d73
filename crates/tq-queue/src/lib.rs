//! telq durable event queue.
//!
//! This crate provides:
//! - A slot-based [`StorageBackend`] abstraction with file and in-memory backends
//! - The persisted queue document codec with per-record validation
//! - [`DurableQueue`]: serialized read-modify-write access to the pending
//!   events, backup-before-overwrite persistence, corruption recovery,
//!   TTL and capacity retention, and in-flight batch tracking
//!
//! # Persisted layout
//!
//! | Slot | Contents |
//! |------|----------|
//! | `Primary` | queue document (`schema_version`, `saved_at`, `events`) |
//! | `Backup` | previous primary contents, copied before every overwrite |
//! | `Stats` | `queued`, `failed_syncs`, `last_sync_time`, `last_failed_sync_time` |
//! | `PurgeMarker` | present while a consent-revocation purge is outstanding |

pub mod document;
pub mod fs;
pub mod inflight;
pub mod queue;
pub mod retention;
pub mod storage;

pub use document::{decode_queue, encode_queue, DecodeError, DecodedQueue, QueueStats};
pub use fs::FileStorage;
pub use inflight::{BatchKey, InFlightTracker};
pub use queue::{
    AdmissionGate, DurableQueue, EnqueueError, EnqueueOutcome, FailureSummary, QueueConfig,
    QueueError,
};
pub use storage::{Fault, MemoryStorage, Slot, StorageBackend, StorageError};

/// Fraction of capacity at which an enqueue first evicts (90%).
pub const EVICTION_THRESHOLD_PERCENT: usize = 90;

/// Share of capacity dropped by a routine eviction pass (10%).
pub const EVICTION_BATCH_PERCENT: usize = 10;

/// Capacity the queue shrinks to after a quota failure (70%).
pub const AGGRESSIVE_TARGET_PERCENT: usize = 70;
