//! Host-environment seams: network reachability and app foreground state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reports whether the collector is currently reachable.
pub trait Connectivity: Send + Sync + fmt::Debug {
    fn is_online(&self) -> bool;
}

/// Connectivity that never reports offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Connectivity toggled by the host (or a test).
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    online: Arc<AtomicBool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        ManualConnectivity {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Application lifecycle state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Background,
}

/// Shared foreground flag. Chained draining and opportunistic dispatch
/// only happen while it is set.
#[derive(Debug, Clone)]
pub struct AppActivity {
    active: Arc<AtomicBool>,
}

impl AppActivity {
    pub fn new(state: AppState) -> Self {
        AppActivity {
            active: Arc::new(AtomicBool::new(state == AppState::Active)),
        }
    }

    pub fn set(&self, state: AppState) {
        self.active.store(state == AppState::Active, Ordering::SeqCst);
    }

    pub fn state(&self) -> AppState {
        if self.is_active() {
            AppState::Active
        } else {
            AppState::Background
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for AppActivity {
    fn default() -> Self {
        Self::new(AppState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_connectivity_toggles() {
        let net = ManualConnectivity::default();
        let shared = net.clone();
        assert!(shared.is_online());
        net.set_online(false);
        assert!(!shared.is_online());
    }

    #[test]
    fn test_app_activity() {
        let app = AppActivity::new(AppState::Background);
        assert!(!app.is_active());
        app.set(AppState::Active);
        assert_eq!(app.state(), AppState::Active);
    }
}
