//! telq core library.
//!
//! This crate provides:
//! - [`ConsentGate`]: the single authority on whether tracking is permitted
//! - The [`Sink`] trait and the bundled [`MemorySink`] / [`JsonlFileSink`]
//! - [`BatchDispatcher`]: batch delivery with capped exponential backoff
//! - [`Analytics`]: the orchestrator that owns identity and exposes the public API
//! - Structured logging setup and CLI exit codes
//!
//! The `tq` binary entry point is in `main.rs`.

pub mod analytics;
pub mod connectivity;
pub mod consent;
pub mod context;
pub mod dispatch;
pub mod exit_codes;
pub mod logging;
pub mod sink;

pub use analytics::{Analytics, AnalyticsBuilder, DropReason, PurgeReport, TrackOutcome};
pub use connectivity::{AlwaysOnline, AppActivity, AppState, Connectivity, ManualConnectivity};
pub use consent::ConsentGate;
pub use context::{ContextProvider, NoContext, StaticContext};
pub use dispatch::{
    guarded_sink_call, BackoffState, BatchDispatcher, DispatchConfig, DispatchOutcome,
    DispatchPhase, DispatchTrigger, SkipReason,
};
pub use sink::{JsonlFileSink, MemorySink, Sink, SinkError};
