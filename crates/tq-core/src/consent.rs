//! Consent gate.
//!
//! A single process-wide flag read at admission time. The gate itself has
//! no side effects; the revocation purge is driven by the orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tq_queue::AdmissionGate;

/// Shared consent flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ConsentGate {
    granted: Arc<AtomicBool>,
}

impl ConsentGate {
    pub fn new(granted: bool) -> Self {
        ConsentGate {
            granted: Arc::new(AtomicBool::new(granted)),
        }
    }

    /// True when tracking is currently permitted.
    pub fn check(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    /// Store a new state and return the previous one.
    pub(crate) fn set(&self, granted: bool) -> bool {
        self.granted.swap(granted, Ordering::SeqCst)
    }
}

impl AdmissionGate for ConsentGate {
    fn admits(&self) -> bool {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_denied() {
        assert!(!ConsentGate::default().check());
    }

    #[test]
    fn test_clones_share_state() {
        let gate = ConsentGate::new(false);
        let view = gate.clone();
        assert!(!gate.set(true));
        assert!(view.check());
        assert!(view.admits());
        assert!(gate.set(false));
        assert!(!view.check());
    }
}
