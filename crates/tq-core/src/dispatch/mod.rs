//! Batch dispatcher.
//!
//! Pulls bounded batches from the [`DurableQueue`], hands them to the
//! [`Sink`], and resolves them with `mark_sent` / `mark_failed`. The queue
//! lock is only held inside those queue calls, never across a send.
//!
//! Phases:
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | `Idle` | ready for the next trigger |
//! | `Dispatching` | one dispatch cycle is running |
//! | `Backoff` | a failure opened a retry window; only a manual flush bypasses it |

mod backoff;

pub use backoff::BackoffState;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tq_common::{Clock, Event, EventId};
use tq_config::PipelineConfig;
use tq_queue::{AdmissionGate, DurableQueue};

use crate::connectivity::{AppActivity, Connectivity};
use crate::sink::{Sink, SinkError};

/// Dispatcher settings derived from [`PipelineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for DispatchConfig {
    fn from(config: &PipelineConfig) -> Self {
        DispatchConfig {
            batch_size: config.batch_size,
            max_attempts: config.max_retry_attempts,
            backoff_base_ms: config.backoff_base_ms,
            backoff_cap_ms: config.backoff_cap_ms,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }
}

/// What asked for a dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTrigger {
    /// Explicit flush; clears any backoff window first.
    Manual,
    Foreground,
    NetworkRegained,
    EventEnqueued,
}

impl std::fmt::Display for DispatchTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchTrigger::Manual => write!(f, "manual"),
            DispatchTrigger::Foreground => write!(f, "foreground"),
            DispatchTrigger::NetworkRegained => write!(f, "network_regained"),
            DispatchTrigger::EventEnqueued => write!(f, "event_enqueued"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Dispatching,
    Backoff,
}

/// Why a dispatch cycle did not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDispatching,
    BackingOff { retry_in_ms: u64 },
    Offline,
    SinkNotReady,
    NotInitialized,
    ConsentDenied,
}

/// Result of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    /// Every fetched batch was delivered. `batches == 0` means nothing was
    /// available (empty queue or overlap with an unresolved batch).
    Drained { batches: usize, events: usize },
    /// Connectivity dropped between fetch and send; the batch was returned.
    WentOffline { sent_events: usize, returned: usize },
    /// Consent was withdrawn between fetch and send. The batch was not
    /// sent and stays in flight until the revocation purge clears it.
    ConsentRevoked { sent_events: usize, withheld: usize },
    /// A send failed and the backoff window advanced.
    Failed {
        sent_events: usize,
        error: SinkError,
        retry_in_ms: u64,
    },
    /// The last batch reached the sink but could not be removed from the
    /// queue. It will be sent again once the backoff window closes.
    Unresolved { sent_events: usize, retry_in_ms: u64 },
}

impl DispatchOutcome {
    /// Events confirmed delivered during the cycle.
    pub fn sent_events(&self) -> usize {
        match self {
            DispatchOutcome::Skipped(_) => 0,
            DispatchOutcome::Drained { events, .. } => *events,
            DispatchOutcome::WentOffline { sent_events, .. }
            | DispatchOutcome::ConsentRevoked { sent_events, .. }
            | DispatchOutcome::Failed { sent_events, .. }
            | DispatchOutcome::Unresolved { sent_events, .. } => *sent_events,
        }
    }
}

/// Marks the dispatcher busy for as long as it lives.
struct PhaseGuard<'a> {
    busy: &'a AtomicBool,
    idle: &'a Notify,
}

impl<'a> PhaseGuard<'a> {
    fn acquire(busy: &'a AtomicBool, idle: &'a Notify) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PhaseGuard { busy, idle })
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

/// Run a sink call with a deadline, turning panics into errors.
pub async fn guarded_sink_call<F>(call: F, timeout: Duration) -> Result<(), SinkError>
where
    F: Future<Output = Result<(), SinkError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(SinkError::Panicked(panic_message(payload.as_ref()))),
        Err(_) => Err(SinkError::Timeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Moves events from the queue to the sink.
#[derive(Debug)]
pub struct BatchDispatcher {
    queue: Arc<DurableQueue>,
    sink: Arc<dyn Sink>,
    connectivity: Arc<dyn Connectivity>,
    app: AppActivity,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    gate: Option<Arc<dyn AdmissionGate>>,
    busy: AtomicBool,
    idle: Notify,
    backoff: Mutex<BackoffState>,
}

impl BatchDispatcher {
    pub fn new(
        queue: Arc<DurableQueue>,
        sink: Arc<dyn Sink>,
        connectivity: Arc<dyn Connectivity>,
        app: AppActivity,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        BatchDispatcher {
            queue,
            sink,
            connectivity,
            app,
            clock,
            config,
            gate: None,
            busy: AtomicBool::new(false),
            idle: Notify::new(),
            backoff: Mutex::new(BackoffState::default()),
        }
    }

    /// Refuse to hand batches to the sink while `gate` denies.
    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn admits(&self) -> bool {
        self.gate.as_ref().is_none_or(|gate| gate.admits())
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffState> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn backoff_state(&self) -> BackoffState {
        *self.backoff()
    }

    pub fn phase(&self) -> DispatchPhase {
        if self.busy.load(Ordering::Acquire) {
            DispatchPhase::Dispatching
        } else if self.backoff().is_blocking(self.clock.now_ms()) {
            DispatchPhase::Backoff
        } else {
            DispatchPhase::Idle
        }
    }

    /// Resolve once no dispatch cycle is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.busy.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Run one dispatch cycle.
    ///
    /// After each delivered batch the cycle continues with the next one
    /// while the app stays active. It ends on an empty fetch, a failure, or
    /// a connectivity drop.
    pub async fn dispatch(&self, trigger: DispatchTrigger) -> DispatchOutcome {
        let Some(_guard) = PhaseGuard::acquire(&self.busy, &self.idle) else {
            debug!(trigger = %trigger, "Dispatch already running");
            return DispatchOutcome::Skipped(SkipReason::AlreadyDispatching);
        };

        let now = self.clock.now_ms();
        {
            let mut backoff = self.backoff();
            if trigger == DispatchTrigger::Manual {
                backoff.reset();
            } else if backoff.is_blocking(now) {
                let retry_in_ms = backoff
                    .next_retry_at
                    .map_or(0, |at| u64::try_from(at - now).unwrap_or(0));
                debug!(trigger = %trigger, retry_in_ms, "Inside backoff window");
                return DispatchOutcome::Skipped(SkipReason::BackingOff { retry_in_ms });
            }
        }

        if !self.admits() {
            debug!(trigger = %trigger, "Consent denied, not dispatching");
            return DispatchOutcome::Skipped(SkipReason::ConsentDenied);
        }
        if !self.connectivity.is_online() {
            debug!(trigger = %trigger, "Offline, not dispatching");
            return DispatchOutcome::Skipped(SkipReason::Offline);
        }
        if !self.sink.is_ready() {
            debug!(trigger = %trigger, "Sink not ready");
            return DispatchOutcome::Skipped(SkipReason::SinkNotReady);
        }

        let mut batches = 0;
        let mut sent_events = 0;
        loop {
            let batch = self.queue.dequeue_batch(self.config.batch_size).await;
            if batch.is_empty() {
                if batches > 0 {
                    info!(trigger = %trigger, batches, events = sent_events, "Queue drained");
                }
                return DispatchOutcome::Drained {
                    batches,
                    events: sent_events,
                };
            }
            let ids: Vec<EventId> = batch.iter().map(|e| e.id().clone()).collect();

            if !self.connectivity.is_online() {
                info!(events = ids.len(), "Went offline after fetch, returning batch");
                self.resolve_failed(&ids).await;
                return DispatchOutcome::WentOffline {
                    sent_events,
                    returned: ids.len(),
                };
            }
            if !self.admits() {
                info!(events = ids.len(), "Consent withdrawn after fetch, batch withheld");
                return DispatchOutcome::ConsentRevoked {
                    sent_events,
                    withheld: ids.len(),
                };
            }

            match self.send(&batch).await {
                Ok(()) => {
                    batches += 1;
                    sent_events += batch.len();
                    match self.queue.mark_sent(&ids).await {
                        Ok(removed) => {
                            self.backoff().reset();
                            debug!(events = removed, "Batch delivered");
                        }
                        Err(e) => {
                            warn!(error = %e, events = ids.len(), "Delivered batch could not be removed");
                            let (retry_in_ms, attempt) = self.open_backoff_window();
                            info!(attempt, retry_in_ms, "Backing off");
                            return DispatchOutcome::Unresolved {
                                sent_events,
                                retry_in_ms,
                            };
                        }
                    }
                    if !self.app.is_active() {
                        return DispatchOutcome::Drained {
                            batches,
                            events: sent_events,
                        };
                    }
                }
                Err(err) => {
                    let transient = err.is_transient() || !self.connectivity.is_online();
                    if transient {
                        warn!(error = %err, events = ids.len(), "Batch delivery failed (network)");
                    } else {
                        error!(error = %err, events = ids.len(), "Batch rejected by sink");
                    }
                    self.resolve_failed(&ids).await;

                    let (retry_in_ms, attempt) = self.open_backoff_window();
                    info!(attempt, retry_in_ms, "Backing off");
                    return DispatchOutcome::Failed {
                        sent_events,
                        error: err,
                        retry_in_ms,
                    };
                }
            }
        }
    }

    /// Advance the backoff state; returns the delay and the attempt number.
    fn open_backoff_window(&self) -> (u64, u32) {
        let mut backoff = self.backoff();
        let delay = backoff.advance(
            self.clock.now_ms(),
            self.config.backoff_base_ms,
            self.config.backoff_cap_ms,
        );
        (delay, backoff.attempt_count)
    }

    async fn send(&self, batch: &[Event]) -> Result<(), SinkError> {
        guarded_sink_call(self.sink.send(batch), self.config.send_timeout).await
    }

    async fn resolve_failed(&self, ids: &[EventId]) {
        match self.queue.mark_failed(ids, self.config.max_attempts).await {
            Ok(summary) => debug!(
                retained = summary.retained,
                dropped = summary.dropped,
                "Batch returned to queue"
            ),
            Err(e) => warn!(error = %e, "Failed to record delivery failure"),
        }
    }
}
