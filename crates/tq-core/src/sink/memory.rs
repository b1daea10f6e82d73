use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use tq_common::{Event, Properties};

use super::{Sink, SinkError};

#[derive(Debug, Default)]
struct Recorded {
    batches: Vec<Vec<Event>>,
    failures: VecDeque<SinkError>,
    panics: usize,
    send_attempts: usize,
    identified: Vec<String>,
    resets: usize,
    reset_failures: usize,
    initialized: usize,
    ready: bool,
    delay: Option<Duration>,
}

/// In-process sink that records what it is given.
///
/// Failures, panics, delays and readiness are scriptable so the dispatcher
/// can be driven through every path without a network.
#[derive(Debug)]
pub struct MemorySink {
    state: Mutex<Recorded>,
}

impl Default for MemorySink {
    fn default() -> Self {
        MemorySink::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            state: Mutex::new(Recorded {
                ready: true,
                ..Recorded::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` sends with `error`.
    pub fn fail_next(&self, count: usize, error: SinkError) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Panic inside the next `count` sends.
    pub fn panic_next(&self, count: usize) {
        self.lock().panics += count;
    }

    /// Fail the next `count` resets.
    pub fn fail_next_resets(&self, count: usize) {
        self.lock().reset_failures += count;
    }

    /// Sleep this long inside every send.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Successfully delivered batches, in order.
    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.lock().batches.clone()
    }

    /// Every successfully delivered event, flattened.
    pub fn delivered(&self) -> Vec<Event> {
        self.lock().batches.iter().flatten().cloned().collect()
    }

    /// Number of `send` calls, successful or not.
    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    pub fn identified(&self) -> Vec<String> {
        self.lock().identified.clone()
    }

    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }

    pub fn init_count(&self) -> usize {
        self.lock().initialized
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn initialize(&self) -> Result<(), SinkError> {
        self.lock().initialized += 1;
        Ok(())
    }

    async fn send(&self, events: &[Event]) -> Result<(), SinkError> {
        let (delay, should_panic, failure) = {
            let mut state = self.lock();
            state.send_attempts += 1;
            let should_panic = state.panics > 0;
            if should_panic {
                state.panics -= 1;
            }
            (state.delay, should_panic, state.failures.pop_front())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if should_panic {
            panic!("scripted sink panic");
        }
        if let Some(error) = failure {
            return Err(error);
        }
        self.lock().batches.push(events.to_vec());
        Ok(())
    }

    async fn identify(&self, user_id: &str, _traits: &Properties) -> Result<(), SinkError> {
        self.lock().identified.push(user_id.to_string());
        Ok(())
    }

    async fn reset(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.reset_failures > 0 {
            state.reset_failures -= 1;
            return Err(SinkError::Io("scripted reset failure".into()));
        }
        state.resets += 1;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.lock().ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tq_common::{EventId, SessionId};

    fn event(id: &str) -> Event {
        Event::new(EventId::from(id), "e", 1, SessionId::from_string("s"))
    }

    #[tokio::test]
    async fn test_records_batches_and_scripted_failures() {
        let sink = MemorySink::new();
        sink.fail_next(1, SinkError::Network("offline".into()));

        let err = sink.send(&[event("a")]).await.unwrap_err();
        assert!(err.is_transient());
        sink.send(&[event("a"), event("b")]).await.unwrap();

        assert_eq!(sink.send_attempts(), 2);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.delivered().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_failures_are_scripted() {
        let sink = MemorySink::new();
        sink.fail_next_resets(1);
        assert!(sink.reset().await.is_err());
        sink.reset().await.unwrap();
        assert_eq!(sink.reset_count(), 1);
    }
}
