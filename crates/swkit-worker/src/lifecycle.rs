//! Worker lifecycle state machine.
//!
//! ```text
//! Parsed → Installing → Waiting → Activating → Active
//!              │            │          │          │
//!              └────────────┴──────────┴──────────┴──→ Redundant
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use swkit_common::{Result, SwKitError};
use tracing::debug;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Script loaded, install not started.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed, waiting for the previous version to let go.
    Waiting,
    /// Garbage-collecting stale caches.
    Activating,
    /// Controlling clients and intercepting fetches.
    Active,
    /// Install failed or replaced by a newer version.
    Redundant,
}

/// Tracks one worker's state and its pending skip-waiting request.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: WorkerState,
    skip_waiting: bool,
    error: Option<String>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Parsed,
            skip_waiting: false,
            error: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Why install failed, if it did.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Active
    }

    /// Whether the worker asked to leave `Waiting` early.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    fn transition(&mut self, from: WorkerState, to: WorkerState) -> Result<()> {
        if self.state != from {
            return Err(SwKitError::InvalidState(format!(
                "cannot move to {to:?} from {:?}",
                self.state
            )));
        }
        self.set_state(to);
        Ok(())
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
    }

    pub fn begin_install(&mut self) -> Result<()> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)
    }

    pub fn install_succeeded(&mut self) -> Result<()> {
        self.transition(WorkerState::Installing, WorkerState::Waiting)
    }

    pub fn install_failed(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.set_state(WorkerState::Redundant);
    }

    /// Record a skip-waiting request. Idempotent; returns whether the worker
    /// is currently waiting.
    pub fn request_skip_waiting(&mut self) -> bool {
        self.skip_waiting = true;
        self.state == WorkerState::Waiting
    }

    pub fn begin_activate(&mut self) -> Result<()> {
        self.transition(WorkerState::Waiting, WorkerState::Activating)
    }

    pub fn activated(&mut self) -> Result<()> {
        self.transition(WorkerState::Activating, WorkerState::Active)
    }

    /// Replaced or discarded. Always allowed.
    pub fn make_redundant(&mut self) {
        if self.state != WorkerState::Redundant {
            self.set_state(WorkerState::Redundant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), WorkerState::Parsed);

        lifecycle.begin_install().unwrap();
        lifecycle.install_succeeded().unwrap();
        assert_eq!(lifecycle.state(), WorkerState::Waiting);

        lifecycle.begin_activate().unwrap();
        lifecycle.activated().unwrap();
        assert!(lifecycle.is_active());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut lifecycle = Lifecycle::new();
        assert!(matches!(
            lifecycle.begin_activate(),
            Err(SwKitError::InvalidState(_))
        ));

        lifecycle.begin_install().unwrap();
        assert!(lifecycle.begin_install().is_err());
    }

    #[test]
    fn test_install_failure_is_terminal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.begin_install().unwrap();
        lifecycle.install_failed("offline.html: 404");

        assert_eq!(lifecycle.state(), WorkerState::Redundant);
        assert_eq!(lifecycle.error(), Some("offline.html: 404"));
        assert!(lifecycle.install_succeeded().is_err());
    }

    #[test]
    fn test_skip_waiting_is_idempotent() {
        let mut lifecycle = Lifecycle::new();
        assert!(!lifecycle.request_skip_waiting());

        lifecycle.begin_install().unwrap();
        lifecycle.install_succeeded().unwrap();
        assert!(lifecycle.request_skip_waiting());
        assert!(lifecycle.request_skip_waiting());
        assert!(lifecycle.skip_waiting_requested());
    }

    #[test]
    fn test_worker_ids_unique() {
        assert_ne!(ServiceWorkerId::new(), ServiceWorkerId::new());
    }
}
