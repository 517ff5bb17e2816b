//! Process liveness and readiness.
//!
//! A [`HealthState`] is created by the composition root (`main`) and
//! handed by `Arc` to whatever needs to flip it. `main` reports
//! [`HealthState::status`] after startup and on shutdown. An embedding
//! process that exposes a probe endpoint reads [`HealthState::is_live`] and
//! [`HealthState::is_ready`] from the same `Arc`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Summary of the two health flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every configured service is running
    Ready,
    /// Live, but some service failed to start (or startup is not finished)
    Degraded,
    /// Shutting down
    Stopping,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Ready => "ready",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Stopping => "stopping",
        })
    }
}

/// Liveness/readiness flags for the broker process.
#[derive(Debug, Default)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthState {
    /// Create a state that is live but not yet ready.
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Whether the process is alive.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Whether every configured service has been started.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Current status derived from the flags.
    pub fn status(&self) -> HealthStatus {
        match (self.is_live(), self.is_ready()) {
            (false, _) => HealthStatus::Stopping,
            (true, true) => HealthStatus::Ready,
            (true, false) => HealthStatus::Degraded,
        }
    }

    /// Mark the process as shutting down: neither live nor ready.
    pub fn shutting_down(&self) {
        self.ready.store(false, Ordering::Release);
        self.live.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_live_not_ready() {
        let health = HealthState::new();
        assert!(health.is_live());
        assert!(!health.is_ready());
    }

    #[test]
    fn test_transitions() {
        let health = HealthState::new();
        assert_eq!(health.status(), HealthStatus::Degraded);

        health.set_ready(true);
        assert!(health.is_ready());
        assert_eq!(health.status(), HealthStatus::Ready);

        health.shutting_down();
        assert!(!health.is_ready());
        assert!(!health.is_live());
        assert_eq!(health.status(), HealthStatus::Stopping);
        assert_eq!(health.status().to_string(), "stopping");
    }
}
