//! File-backed storage: one JSON file per slot.
//!
//! Writes go to a `.tmp` sibling which is fsynced and atomically renamed
//! over the slot file, so a crash mid-write leaves either the old or the new
//! document, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::storage::{Slot, StorageBackend, StorageError};

/// Slot storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
    max_value_bytes: Option<usize>,
}

impl FileStorage {
    /// Open (creating if needed) storage under `base_dir`.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(FileStorage {
            base_dir,
            max_value_bytes: None,
        })
    }

    /// Reject any single document larger than `max_bytes`.
    pub fn with_quota(mut self, max_bytes: usize) -> Self {
        self.max_value_bytes = Some(max_bytes);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the file backing a slot.
    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        self.base_dir.join(format!("{}.json", slot.key()))
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn read(&self, slot: Slot) -> Result<Option<String>, StorageError> {
        match fs::read(self.slot_path(slot)).await {
            // Invalid UTF-8 is handed up as lossy text; the document decoder rejects it.
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, slot: Slot, contents: &str) -> Result<(), StorageError> {
        if let Some(max) = self.max_value_bytes {
            if contents.len() > max {
                return Err(StorageError::QuotaExceeded {
                    slot: slot.key(),
                    bytes: contents.len(),
                    max,
                });
            }
        }

        let final_path = self.slot_path(slot);
        let temp_path = final_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &final_path).await?;
        debug!(slot = %slot, bytes = contents.len(), "slot written");
        Ok(())
    }

    async fn remove(&self, slot: Slot) -> Result<(), StorageError> {
        match fs::remove_file(self.slot_path(slot)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();

        assert!(storage.read(Slot::Primary).await.unwrap().is_none());
        storage.write(Slot::Primary, "{\"a\":1}").await.unwrap();
        assert_eq!(
            storage.read(Slot::Primary).await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert!(dir.path().join("queue.json").exists());
        assert!(!dir.path().join("queue.json.tmp").exists());

        storage.remove(Slot::Primary).await.unwrap();
        assert!(storage.read(Slot::Primary).await.unwrap().is_none());
        storage.remove(Slot::Primary).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_quota() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap().with_quota(8);
        storage.write(Slot::Backup, "small").await.unwrap();
        let err = storage.write(Slot::Backup, "far too large").await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(
            storage.read(Slot::Backup).await.unwrap().as_deref(),
            Some("small")
        );
    }

    #[tokio::test]
    async fn test_file_read_tolerates_binary_garbage() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        std::fs::write(storage.slot_path(Slot::Primary), [0xff, 0xfe, 0x00]).unwrap();
        let raw = storage.read(Slot::Primary).await.unwrap().unwrap();
        assert!(!raw.is_empty());
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::open(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(storage.base_dir(), nested.as_path());
    }
}
