//! Slot-based storage backends.
//!
//! The queue never talks to a filesystem or key-value store directly. It
//! reads and writes whole documents through [`StorageBackend`], one document
//! per [`Slot`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Logical storage slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Current queue document.
    Primary,
    /// Previous queue document, written before each primary overwrite.
    Backup,
    /// Delivery statistics document.
    Stats,
    /// Marker for an unfinished consent-revocation purge.
    PurgeMarker,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Primary, Slot::Backup, Slot::Stats, Slot::PurgeMarker];

    /// Stable storage key for this slot.
    pub fn key(&self) -> &'static str {
        match self {
            Slot::Primary => "queue",
            Slot::Backup => "queue.backup",
            Slot::Stats => "stats",
            Slot::PurgeMarker => "purge_pending",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Errors from storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Quota exceeded for {slot}: {bytes} bytes (max {max})")]
    QuotaExceeded {
        slot: &'static str,
        bytes: usize,
        max: usize,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// True for size/quota failures, which the queue answers with an
    /// aggressive cleanup and a single retry.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Document store with one value per slot.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Read a slot. `Ok(None)` means the slot has never been written.
    async fn read(&self, slot: Slot) -> Result<Option<String>, StorageError>;

    /// Replace a slot's contents.
    async fn write(&self, slot: Slot, contents: &str) -> Result<(), StorageError>;

    /// Delete a slot. Removing an absent slot is not an error.
    async fn remove(&self, slot: Slot) -> Result<(), StorageError>;
}

/// Failure to inject into the next operations on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Quota,
    Io,
}

impl Fault {
    fn to_error(self, slot: Slot, bytes: usize) -> StorageError {
        match self {
            Fault::Quota => StorageError::QuotaExceeded {
                slot: slot.key(),
                bytes,
                max: 0,
            },
            Fault::Io => StorageError::Io(std::io::Error::other("injected fault")),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    slots: HashMap<Slot, String>,
    quota: Option<usize>,
    write_faults: HashMap<Slot, Vec<Fault>>,
    remove_faults: HashMap<Slot, usize>,
    writes: HashMap<Slot, usize>,
}

/// In-process storage with an optional per-value quota and fault injection.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any single value larger than `max_bytes`.
    pub fn with_quota(max_bytes: usize) -> Self {
        let storage = Self::default();
        storage.lock().quota = Some(max_bytes);
        storage
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_quota(&self, max_bytes: Option<usize>) {
        self.lock().quota = max_bytes;
    }

    /// Make the next `count` writes to `slot` fail with `fault`.
    pub fn fail_next_writes(&self, slot: Slot, count: usize, fault: Fault) {
        let mut state = self.lock();
        let queue = state.write_faults.entry(slot).or_default();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Make the next `count` removals of `slot` fail.
    pub fn fail_next_removes(&self, slot: Slot, count: usize) {
        *self.lock().remove_faults.entry(slot).or_default() += count;
    }

    /// Overwrite a slot directly, bypassing quota and faults.
    pub fn put_raw(&self, slot: Slot, contents: &str) {
        self.lock().slots.insert(slot, contents.to_string());
    }

    /// Peek at a slot directly.
    pub fn get_raw(&self, slot: Slot) -> Option<String> {
        self.lock().slots.get(&slot).cloned()
    }

    /// Number of successful writes to a slot.
    pub fn write_count(&self, slot: Slot) -> usize {
        self.lock().writes.get(&slot).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, slot: Slot) -> Result<Option<String>, StorageError> {
        Ok(self.lock().slots.get(&slot).cloned())
    }

    async fn write(&self, slot: Slot, contents: &str) -> Result<(), StorageError> {
        let mut state = self.lock();
        if let Some(faults) = state.write_faults.get_mut(&slot) {
            if !faults.is_empty() {
                let fault = faults.remove(0);
                return Err(fault.to_error(slot, contents.len()));
            }
        }
        if let Some(max) = state.quota {
            if contents.len() > max {
                return Err(StorageError::QuotaExceeded {
                    slot: slot.key(),
                    bytes: contents.len(),
                    max,
                });
            }
        }
        state.slots.insert(slot, contents.to_string());
        *state.writes.entry(slot).or_default() += 1;
        Ok(())
    }

    async fn remove(&self, slot: Slot) -> Result<(), StorageError> {
        let mut state = self.lock();
        if let Some(pending) = state.remove_faults.get_mut(&slot) {
            if *pending > 0 {
                *pending -= 1;
                return Err(Fault::Io.to_error(slot, 0));
            }
        }
        state.slots.remove(&slot);
        Ok(())
    }
}
