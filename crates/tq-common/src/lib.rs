//! telq common types: events, identifiers, and clocks.
//!
//! This crate provides the foundational types shared across the telq crates:
//! - Immutable [`Event`] records and their queue wrapper [`QueuedEvent`]
//! - Collision-resistant event and session identifiers
//! - An explicitly owned [`IdGenerator`] (time + counter + randomness)
//! - A [`Clock`] abstraction so retention and backoff are testable

pub mod clock;
pub mod event;
pub mod id;

pub use clock::{system_clock, Clock, ManualClock, Millis, SystemClock};
pub use event::{Event, Properties, QueuedEvent};
pub use id::{EventId, IdGenerator, SessionId};

/// Schema version for persisted queue documents.
pub const SCHEMA_VERSION: &str = "1";
