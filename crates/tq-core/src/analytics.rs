//! The `Analytics` orchestrator.
//!
//! One explicitly constructed instance wires the consent gate, the durable
//! queue, the dispatcher and the sink together, and owns session identity.
//! Lifecycle: [`Analytics::initialize`] → active → [`Analytics::cleanup`].
//!
//! Nothing here surfaces an error to the host for tracking. Admission
//! failures come back as [`TrackOutcome::Dropped`]; storage and sink
//! failures are logged.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tq_common::{system_clock, Clock, Event, EventId, IdGenerator, Properties, SessionId};
use tq_config::PipelineConfig;
use tq_queue::{
    DurableQueue, EnqueueError, EnqueueOutcome, QueueConfig, QueueError, QueueStats,
    StorageBackend,
};
use tq_redact::{DefaultValidator, PropertyValidator, ValidationIssue};

use crate::connectivity::{AlwaysOnline, AppActivity, AppState, Connectivity};
use crate::consent::ConsentGate;
use crate::context::{ContextProvider, NoContext};
use crate::dispatch::{
    guarded_sink_call, BatchDispatcher, DispatchConfig, DispatchOutcome, DispatchTrigger,
    SkipReason,
};
use crate::sink::Sink;

/// Why `track` did not queue an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    ConsentDenied,
    NotInitialized,
    Invalid(ValidationIssue),
    /// Same id already queued.
    Duplicate,
    /// Storage stayed full after the cleanup retry.
    StorageFull,
    StorageError,
}

/// Admission result of [`Analytics::track`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Queued(EventId),
    Dropped(DropReason),
}

impl TrackOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, TrackOutcome::Queued(_))
    }
}

/// Which halves of a revocation purge succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub queue_cleared: bool,
    pub sink_reset: bool,
}

impl PurgeReport {
    pub fn complete(&self) -> bool {
        self.queue_cleared && self.sink_reset
    }
}

#[derive(Debug)]
struct Identity {
    user_id: Option<String>,
    session_id: SessionId,
}

/// Builder for [`Analytics`].
pub struct AnalyticsBuilder {
    store: Arc<dyn StorageBackend>,
    sink: Arc<dyn Sink>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn PropertyValidator>,
    context: Arc<dyn ContextProvider>,
    connectivity: Arc<dyn Connectivity>,
    app: AppActivity,
}

impl AnalyticsBuilder {
    pub fn new(store: Arc<dyn StorageBackend>, sink: Arc<dyn Sink>) -> Self {
        let config = PipelineConfig::default();
        AnalyticsBuilder {
            store,
            sink,
            validator: Arc::new(DefaultValidator::new(config.validation.clone())),
            config,
            clock: system_clock(),
            context: Arc::new(NoContext),
            connectivity: Arc::new(AlwaysOnline),
            app: AppActivity::default(),
        }
    }

    /// Replace the configuration. Also rebuilds the default validator with
    /// the new limits; call [`AnalyticsBuilder::validator`] afterwards to
    /// override it.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.validator = Arc::new(DefaultValidator::new(config.validation.clone()));
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn PropertyValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn context(mut self, context: Arc<dyn ContextProvider>) -> Self {
        self.context = context;
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn app_activity(mut self, app: AppActivity) -> Self {
        self.app = app;
        self
    }

    pub fn build(self) -> Analytics {
        let consent = ConsentGate::new(self.config.consent_default);
        let queue = Arc::new(
            DurableQueue::new(self.store, QueueConfig::from(&self.config), self.clock.clone())
                .with_gate(Arc::new(consent.clone())),
        );
        let dispatcher = Arc::new(
            BatchDispatcher::new(
                queue.clone(),
                self.sink.clone(),
                self.connectivity,
                self.app.clone(),
                self.clock.clone(),
                DispatchConfig::from(&self.config),
            )
            .with_gate(Arc::new(consent.clone())),
        );
        let ids = IdGenerator::new(self.clock.clone());
        let session_id = ids.session();

        Analytics {
            config: self.config,
            consent,
            queue,
            sink: self.sink,
            dispatcher,
            validator: self.validator,
            context: self.context,
            app: self.app,
            clock: self.clock,
            ids,
            identity: Mutex::new(Identity {
                user_id: None,
                session_id,
            }),
            initialized: AtomicBool::new(false),
            background: Mutex::new(JoinSet::new()),
        }
    }
}

/// Public facade of the telemetry pipeline.
pub struct Analytics {
    config: PipelineConfig,
    consent: ConsentGate,
    queue: Arc<DurableQueue>,
    sink: Arc<dyn Sink>,
    dispatcher: Arc<BatchDispatcher>,
    validator: Arc<dyn PropertyValidator>,
    context: Arc<dyn ContextProvider>,
    app: AppActivity,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    identity: Mutex<Identity>,
    initialized: AtomicBool,
    background: Mutex<JoinSet<()>>,
}

impl fmt::Debug for Analytics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analytics")
            .field("consent", &self.consent.check())
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("queue", &self.queue)
            .field("sink", &self.sink)
            .finish()
    }
}

impl Analytics {
    pub fn builder(store: Arc<dyn StorageBackend>, sink: Arc<dyn Sink>) -> AnalyticsBuilder {
        AnalyticsBuilder::new(store, sink)
    }

    fn identity(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sink_timeout(&self) -> std::time::Duration {
        self.dispatcher.config().send_timeout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<BatchDispatcher> {
        &self.dispatcher
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn has_consent(&self) -> bool {
        self.consent.check()
    }

    pub fn session_id(&self) -> SessionId {
        self.identity().session_id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity().user_id.clone()
    }

    /// Start the pipeline: initialize the sink, recover the queue, and
    /// finish any revocation purge left over from a previous run.
    pub async fn initialize(&self) {
        if self.is_initialized() {
            debug!("Already initialized");
            return;
        }

        if let Err(e) = guarded_sink_call(self.sink.initialize(), self.sink_timeout()).await {
            warn!(error = %e, "Sink initialization failed, events will stay queued");
        }

        match self.queue.initialize().await {
            Ok(events) => debug!(events, "Queue recovered"),
            Err(e) => warn!(error = %e, "Queue initialization failed"),
        }

        if self.queue.purge_pending().await {
            info!("Resuming unfinished consent revocation purge");
            self.purge().await;
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(consent = self.has_consent(), "Analytics initialized");
    }

    /// End the lifecycle. Waits for background dispatches; later calls
    /// to `track` are dropped as not initialized.
    pub async fn cleanup(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.wait_for_background().await;
        info!("Analytics cleaned up");
    }

    /// Record an event.
    ///
    /// Admission order: consent, initialization, validation, construction,
    /// enqueue, then an opportunistic dispatch if the app is active.
    pub async fn track(&self, name: &str, properties: Properties) -> TrackOutcome {
        if !self.consent.check() {
            debug!("Consent not granted, event dropped");
            return TrackOutcome::Dropped(DropReason::ConsentDenied);
        }
        if !self.is_initialized() {
            debug!("Not initialized, event dropped");
            return TrackOutcome::Dropped(DropReason::NotInitialized);
        }

        let checked = self
            .validator
            .validate_name(name)
            .into_result()
            .and_then(|_| self.validator.validate(&properties).into_result());
        if let Err(issue) = checked {
            debug!(reason = %issue, "Event failed validation, dropped");
            return TrackOutcome::Dropped(DropReason::Invalid(issue));
        }

        let event = {
            let identity = self.identity();
            Event::new(
                self.ids.next(),
                name,
                self.clock.now_ms(),
                identity.session_id.clone(),
            )
            .with_user(identity.user_id.clone())
            .with_properties(properties)
            .with_context(self.context.snapshot())
        };
        let id = event.id().clone();

        let outcome = match self.queue.enqueue(event).await {
            Ok(EnqueueOutcome::Stored { .. } | EnqueueOutcome::StoredAfterCleanup { .. }) => {
                TrackOutcome::Queued(id)
            }
            Ok(EnqueueOutcome::Duplicate) => TrackOutcome::Dropped(DropReason::Duplicate),
            Ok(EnqueueOutcome::Dropped) => TrackOutcome::Dropped(DropReason::StorageFull),
            Err(EnqueueError::ConsentDenied) => {
                debug!("Consent revoked during enqueue, event dropped");
                TrackOutcome::Dropped(DropReason::ConsentDenied)
            }
            Err(e) => {
                warn!(error = %e, "Enqueue failed, event dropped");
                TrackOutcome::Dropped(DropReason::StorageError)
            }
        };

        if outcome.is_queued() && self.app.is_active() {
            self.spawn_dispatch(DispatchTrigger::EventEnqueued);
        }
        outcome
    }

    /// Associate subsequent events with `user_id`.
    ///
    /// On a genuine change, pending events of the outgoing identity are
    /// flushed (with consent) or discarded (without), and the session id is
    /// regenerated either way.
    pub async fn identify(&self, user_id: &str, traits: Properties) {
        let changed = self.identity().user_id.as_deref() != Some(user_id);
        if changed {
            self.settle_outgoing_identity().await;
            let mut identity = self.identity();
            identity.user_id = Some(user_id.to_string());
            identity.session_id = self.ids.session();
            info!(session_id = %identity.session_id, "Identity changed, new session");
        }

        if self.consent.check() {
            if let Err(e) =
                guarded_sink_call(self.sink.identify(user_id, &traits), self.sink_timeout()).await
            {
                warn!(error = %e, "Sink identify failed");
            }
        }
    }

    /// Drop the current identity and start a fresh anonymous session.
    pub async fn logout(&self) {
        if self.identity().user_id.is_some() {
            self.settle_outgoing_identity().await;
        }
        {
            let mut identity = self.identity();
            identity.user_id = None;
            identity.session_id = self.ids.session();
            info!(session_id = %identity.session_id, "Logged out, new session");
        }
        if let Err(e) = guarded_sink_call(self.sink.reset(), self.sink_timeout()).await {
            warn!(error = %e, "Sink reset on logout failed");
        }
    }

    async fn settle_outgoing_identity(&self) {
        if self.consent.check() {
            let mut outcome = self.dispatcher.dispatch(DispatchTrigger::Manual).await;
            if outcome == DispatchOutcome::Skipped(SkipReason::AlreadyDispatching) {
                debug!("Waiting for running dispatch before identity change");
                self.dispatcher.wait_idle().await;
                outcome = self.dispatcher.dispatch(DispatchTrigger::Manual).await;
            }
            match outcome {
                DispatchOutcome::Drained { events, .. } => {
                    debug!(sent = events, "Flushed outgoing identity");
                }
                other => info!(
                    sent = other.sent_events(),
                    outcome = ?other,
                    "Outgoing identity only partly flushed, events stay queued"
                ),
            }
        } else if let Err(e) = self.queue.clear().await {
            warn!(error = %e, "Failed to discard events of outgoing identity");
        }
    }

    /// Deliver pending events now, bypassing any backoff window.
    pub async fn flush(&self) -> DispatchOutcome {
        if !self.is_initialized() {
            return DispatchOutcome::Skipped(SkipReason::NotInitialized);
        }
        if !self.consent.check() {
            return DispatchOutcome::Skipped(SkipReason::ConsentDenied);
        }
        self.dispatcher.dispatch(DispatchTrigger::Manual).await
    }

    /// Grant or revoke tracking consent.
    ///
    /// Revoking clears the queue and resets the sink before returning. A
    /// purge that does not fully succeed is recorded and retried on the
    /// next grant or the next `initialize`.
    pub async fn set_consent(&self, granted: bool) -> Option<PurgeReport> {
        if granted {
            let report = if self.queue.purge_pending().await {
                info!("Retrying unfinished revocation purge before granting consent");
                Some(self.purge().await)
            } else {
                None
            };
            if !self.consent.set(true) {
                info!("Consent granted");
            }
            return report;
        }

        let was_granted = self.consent.set(false);
        if was_granted || self.queue.purge_pending().await {
            info!("Consent revoked, purging");
            Some(self.purge().await)
        } else {
            None
        }
    }

    /// Clear the queue and reset the sink. Each half runs regardless of the
    /// other; the purge marker is removed only when both succeed.
    async fn purge(&self) -> PurgeReport {
        if let Err(e) = self.queue.mark_purge_pending().await {
            warn!(error = %e, "Could not record pending purge");
        }

        let queue_cleared = match self.queue.clear().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Queue purge failed, will retry");
                false
            }
        };
        let sink_reset = match guarded_sink_call(self.sink.reset(), self.sink_timeout()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Sink reset failed, will retry");
                false
            }
        };

        let report = PurgeReport {
            queue_cleared,
            sink_reset,
        };
        if report.complete() {
            if let Err(e) = self.queue.clear_purge_marker().await {
                warn!(error = %e, "Could not clear purge marker");
            }
        }
        report
    }

    /// Tell the pipeline the app moved to the foreground or background.
    pub fn set_app_state(&self, state: AppState) {
        self.app.set(state);
        if state == AppState::Active {
            self.spawn_dispatch(DispatchTrigger::Foreground);
        }
    }

    pub fn connectivity_regained(&self) {
        self.spawn_dispatch(DispatchTrigger::NetworkRegained);
    }

    /// Remove every queued event attributed to `user_id`.
    pub async fn erase_user(&self, user_id: &str) -> Result<usize, QueueError> {
        self.queue.remove_events_for_user(user_id).await
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.get_stats().await
    }

    /// Wait for every spawned dispatch to finish.
    pub async fn wait_for_background(&self) {
        let mut tasks = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *background)
        };
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background dispatch task failed");
            }
        }
    }

    /// Start a dispatch without waiting for it.
    fn spawn_dispatch(&self, trigger: DispatchTrigger) {
        if !self.is_initialized() || !self.consent.check() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(trigger = %trigger, "No async runtime, skipping dispatch");
            return;
        };

        let dispatcher = self.dispatcher.clone();
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(finished) = background.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Background dispatch task failed");
            }
        }
        background.spawn_on(
            async move {
                let outcome = dispatcher.dispatch(trigger).await;
                debug!(trigger = %trigger, outcome = ?outcome, "Background dispatch finished");
            },
            &handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;
    use tq_common::ManualClock;
    use tq_queue::{MemoryStorage, Slot};

    struct Rig {
        store: Arc<MemoryStorage>,
        sink: Arc<MemorySink>,
        clock: Arc<ManualClock>,
        analytics: Analytics,
    }

    /// Background app so nothing is delivered behind the test's back.
    async fn rig() -> Rig {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::default());
        let analytics = Analytics::builder(store.clone(), sink.clone())
            .clock(clock.clone())
            .app_activity(AppActivity::new(AppState::Background))
            .build();
        analytics.initialize().await;
        Rig {
            store,
            sink,
            clock,
            analytics,
        }
    }

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn queued_names(analytics: &Analytics) -> Vec<String> {
        analytics
            .queue()
            .get_all_events()
            .await
            .iter()
            .map(|q| q.event.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_consent_defaults_to_denied() {
        let r = rig().await;
        assert!(!r.analytics.has_consent());
        assert_eq!(
            r.analytics.track("open", Properties::new()).await,
            TrackOutcome::Dropped(DropReason::ConsentDenied)
        );
        assert!(r.store.get_raw(Slot::Primary).is_none());
    }

    #[tokio::test]
    async fn test_not_initialized_drops() {
        let analytics = Analytics::builder(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemorySink::new()),
        )
        .build();
        analytics.set_consent(true).await;
        assert_eq!(
            analytics.track("open", Properties::new()).await,
            TrackOutcome::Dropped(DropReason::NotInitialized)
        );
    }

    #[tokio::test]
    async fn test_invalid_properties_drop() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        let outcome = r
            .analytics
            .track("signup", props(json!({ "email": "a@b.co" })))
            .await;
        assert!(matches!(
            outcome,
            TrackOutcome::Dropped(DropReason::Invalid(ValidationIssue::DeniedKey { .. }))
        ));
        assert!(r.analytics.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_track_builds_event_from_identity_and_context() {
        let store = Arc::new(MemoryStorage::new());
        let analytics = Analytics::builder(store, Arc::new(MemorySink::new()))
            .clock(Arc::new(ManualClock::default()))
            .context(Arc::new(crate::context::StaticContext::new(json!({ "os": "linux" }))))
            .app_activity(AppActivity::new(AppState::Background))
            .build();
        analytics.initialize().await;
        analytics.set_consent(true).await;
        analytics.identify("user-1", Properties::new()).await;

        let outcome = analytics
            .track("purchase", props(json!({ "sku": "A1", "qty": 2 })))
            .await;
        assert!(outcome.is_queued());

        let stored = analytics.queue().get_all_events().await;
        let event = &stored[0].event;
        assert_eq!(event.user_id(), Some("user-1"));
        assert_eq!(event.session_id(), &analytics.session_id());
        assert_eq!(event.context()["os"], "linux");
        assert_eq!(event.properties()["qty"], 2);
        assert_eq!(event.timestamp(), ManualClock::default().now_ms());
    }

    #[tokio::test]
    async fn test_consent_scenario() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        r.analytics.track("a", Properties::new()).await;
        assert_eq!(queued_names(&r.analytics).await, vec!["a"]);

        let report = r.analytics.set_consent(false).await.unwrap();
        assert!(report.complete());
        assert!(r.analytics.queue().is_empty().await);
        assert_eq!(r.sink.reset_count(), 1);

        r.analytics.track("b", Properties::new()).await;
        assert!(r.analytics.queue().is_empty().await);

        r.analytics.set_consent(true).await;
        r.analytics.track("c", Properties::new()).await;
        assert_eq!(queued_names(&r.analytics).await, vec!["c"]);
    }

    #[tokio::test]
    async fn test_failed_sink_reset_is_retried_on_grant() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        r.analytics.track("a", Properties::new()).await;
        r.sink.fail_next_resets(1);

        let report = r.analytics.set_consent(false).await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                queue_cleared: true,
                sink_reset: false
            }
        );
        assert!(r.analytics.queue().is_empty().await);
        assert!(r.store.get_raw(Slot::PurgeMarker).is_some());

        let retry = r.analytics.set_consent(true).await.unwrap();
        assert!(retry.complete());
        assert!(r.store.get_raw(Slot::PurgeMarker).is_none());
        assert_eq!(r.sink.reset_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_queue_clear_does_not_block_sink_reset() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        r.analytics.track("a", Properties::new()).await;
        r.analytics.track("b", Properties::new()).await;
        r.store.fail_next_removes(Slot::Primary, 1);
        r.store
            .fail_next_writes(Slot::Primary, 1, tq_queue::Fault::Io);

        let report = r.analytics.set_consent(false).await.unwrap();
        assert!(!report.queue_cleared);
        assert!(report.sink_reset);
        assert!(r.store.get_raw(Slot::PurgeMarker).is_some());

        // Next start finishes the job.
        let restarted = Analytics::builder(r.store.clone(), r.sink.clone())
            .clock(r.clock.clone())
            .build();
        restarted.initialize().await;
        assert!(restarted.queue().is_empty().await);
        assert!(r.store.get_raw(Slot::PurgeMarker).is_none());
    }

    #[tokio::test]
    async fn test_identify_regenerates_session_without_consent() {
        let r = rig().await;
        let before = r.analytics.session_id();
        r.analytics.identify("alice", Properties::new()).await;
        let after_login = r.analytics.session_id();
        assert_ne!(before, after_login);
        assert_eq!(r.analytics.user_id().as_deref(), Some("alice"));
        // No consent, so the sink never hears about the user.
        assert!(r.sink.identified().is_empty());

        r.analytics.identify("alice", Properties::new()).await;
        assert_eq!(r.analytics.session_id(), after_login);

        r.analytics.logout().await;
        assert_ne!(r.analytics.session_id(), after_login);
        assert_eq!(r.analytics.user_id(), None);
    }

    #[tokio::test]
    async fn test_identity_switch_waits_for_running_dispatch() {
        let sink = Arc::new(MemorySink::new());
        let analytics = Analytics::builder(Arc::new(MemoryStorage::new()), sink.clone())
            .config(PipelineConfig {
                batch_size: 1,
                ..PipelineConfig::default()
            })
            .clock(Arc::new(ManualClock::default()))
            .app_activity(AppActivity::new(AppState::Background))
            .build();
        analytics.initialize().await;
        analytics.set_consent(true).await;
        analytics.identify("alice", Properties::new()).await;
        analytics.track("first", Properties::new()).await;
        analytics.track("second", Properties::new()).await;

        sink.set_delay(Some(std::time::Duration::from_millis(100)));
        let (outcome, ()) = tokio::join!(analytics.flush(), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            analytics.identify("bob", Properties::new()).await;
        });
        assert_eq!(outcome.sent_events(), 1);

        let names: Vec<_> = sink.delivered().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(analytics.queue().is_empty().await);
        assert_eq!(analytics.user_id().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_identity_switch_flushes_outgoing_events() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        r.analytics.identify("alice", Properties::new()).await;
        r.analytics.track("alice_event", Properties::new()).await;

        r.analytics.identify("bob", Properties::new()).await;
        let delivered = r.sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].user_id(), Some("alice"));
        assert_eq!(r.sink.identified(), vec!["alice", "bob"]);
        assert!(r.analytics.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_flush_requires_initialization_and_consent() {
        let analytics = Analytics::builder(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemorySink::new()),
        )
        .build();
        assert_eq!(
            analytics.flush().await,
            DispatchOutcome::Skipped(SkipReason::NotInitialized)
        );
        analytics.initialize().await;
        assert_eq!(
            analytics.flush().await,
            DispatchOutcome::Skipped(SkipReason::ConsentDenied)
        );
    }

    #[tokio::test]
    async fn test_foreground_triggers_background_dispatch() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        r.analytics.track("queued_in_background", Properties::new()).await;
        assert_eq!(r.sink.send_attempts(), 0);

        r.analytics.set_app_state(AppState::Active);
        r.analytics.wait_for_background().await;
        assert_eq!(r.sink.delivered().len(), 1);
        assert!(r.analytics.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_stops_admission() {
        let r = rig().await;
        r.analytics.set_consent(true).await;
        r.analytics.cleanup().await;
        assert_eq!(
            r.analytics.track("late", Properties::new()).await,
            TrackOutcome::Dropped(DropReason::NotInitialized)
        );
    }
}
