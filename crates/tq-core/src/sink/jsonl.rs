use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use tq_common::{Event, Properties};

use super::{Sink, SinkError};

/// One line in the output file.
#[derive(Serialize)]
struct Line<'a> {
    #[serde(flatten)]
    event: &'a Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    identified_as: Option<&'a str>,
}

/// Appends every delivered event as one JSON line.
///
/// A batch is rendered up front and written with a single append, so a
/// failed write never leaves half a batch behind a success.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    ready: AtomicBool,
    identity: Mutex<Option<String>>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlFileSink {
            path: path.into(),
            ready: AtomicBool::new(false),
            identity: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn identity(&self) -> Option<String> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_identity(&self, user_id: Option<String>) {
        *self.identity.lock().unwrap_or_else(|e| e.into_inner()) = user_id;
    }
}

#[async_trait]
impl Sink for JsonlFileSink {
    async fn initialize(&self) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, events: &[Event]) -> Result<(), SinkError> {
        if !self.is_ready() {
            return Err(SinkError::NotReady);
        }
        let identity = self.identity();
        let mut buf = String::new();
        for event in events {
            let line = Line {
                event,
                identified_as: identity.as_deref(),
            };
            buf.push_str(&serde_json::to_string(&line)?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.sync_data().await?;
        debug!(path = %self.path.display(), events = events.len(), "Appended batch");
        Ok(())
    }

    async fn identify(&self, user_id: &str, _traits: &Properties) -> Result<(), SinkError> {
        self.set_identity(Some(user_id.to_string()));
        Ok(())
    }

    async fn reset(&self) -> Result<(), SinkError> {
        self.set_identity(None);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
