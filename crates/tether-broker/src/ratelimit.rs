//! Per-machine admission accounting
//!
//! Warn-only mode: every call is admitted, but threshold breaches are
//! counted so limits can be tuned before enforcement is ever turned on.
//! State is ephemeral and rebuilt from nothing after a restart.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::control::RateStats;
use tether_core::MachineId;

/// Width of the rolling request window
const WINDOW: Duration = Duration::from_secs(60);

/// Effective limits for one machine (overrides already resolved against
/// the global defaults)
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Requests per minute
    pub rpm: u32,
    /// Concurrent in-flight operations
    pub concurrent: u32,
}

/// Outcome of an admission check. Always admitted in warn-only mode.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    /// Requests within the trailing window, including this one
    pub rpm_current: u32,
    /// In-flight operations, including this one
    pub concurrent_current: u32,
    /// Whether any threshold was breached by this call
    pub warned: bool,
}

/// Per-machine counters
#[derive(Debug, Default)]
struct RateState {
    /// Request instants within the trailing window
    window: VecDeque<Instant>,
    /// In-flight operation count
    concurrent: u32,
    /// Cumulative rpm threshold breaches
    rpm_warnings: u64,
    /// Cumulative concurrency threshold breaches
    concurrent_warnings: u64,
}

/// Warn-only per-machine rate limiter
#[derive(Default)]
pub struct RateLimiter {
    states: DashMap<MachineId, RateState>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and take a concurrency slot. Never rejects.
    pub fn admit(&self, id: &MachineId, limits: RateLimits) -> Admission {
        let now = Instant::now();
        let mut state = self.states.entry(id.clone()).or_default();

        while let Some(front) = state.window.front() {
            if now.duration_since(*front) > WINDOW {
                state.window.pop_front();
            } else {
                break;
            }
        }
        state.window.push_back(now);
        state.concurrent += 1;

        let rpm_current = state.window.len() as u32;
        let concurrent_current = state.concurrent;

        let mut warned = false;
        if rpm_current > limits.rpm {
            state.rpm_warnings += 1;
            warned = true;
            tracing::warn!(
                "Machine {} exceeded rpm limit: {} > {} (warn-only)",
                id,
                rpm_current,
                limits.rpm
            );
        }
        if concurrent_current > limits.concurrent {
            state.concurrent_warnings += 1;
            warned = true;
            tracing::warn!(
                "Machine {} exceeded concurrency limit: {} > {} (warn-only)",
                id,
                concurrent_current,
                limits.concurrent
            );
        }

        Admission {
            rpm_current,
            concurrent_current,
            warned,
        }
    }

    /// Release the concurrency slot taken by `admit`. Must run exactly
    /// once per admission; use `admit_guarded` to make that automatic.
    pub fn release(&self, id: &MachineId) {
        if let Some(mut state) = self.states.get_mut(id) {
            if state.concurrent == 0 {
                tracing::error!("Release without matching admit for machine {}", id);
            } else {
                state.concurrent -= 1;
            }
        }
    }

    /// Admit and return a guard that releases the slot on drop, covering
    /// early returns, timeouts, and transport failures alike.
    pub fn admit_guarded(self: &Arc<Self>, id: &MachineId, limits: RateLimits) -> RateGuard {
        let admission = self.admit(id, limits);
        RateGuard {
            limiter: Arc::clone(self),
            id: id.clone(),
            admission,
        }
    }

    /// Current counters and cumulative warnings for a machine
    pub fn stats(&self, id: &MachineId, limits: RateLimits) -> RateStats {
        let now = Instant::now();
        let mut state = self.states.entry(id.clone()).or_default();

        while let Some(front) = state.window.front() {
            if now.duration_since(*front) > WINDOW {
                state.window.pop_front();
            } else {
                break;
            }
        }

        RateStats {
            rpm_current: state.window.len() as u32,
            concurrent_current: state.concurrent,
            rpm_limit: limits.rpm,
            concurrent_limit: limits.concurrent,
            rpm_warnings: state.rpm_warnings,
            concurrent_warnings: state.concurrent_warnings,
        }
    }
}

/// RAII admission slot. Dropping the guard releases the machine's
/// concurrency slot exactly once.
pub struct RateGuard {
    limiter: Arc<RateLimiter>,
    id: MachineId,
    admission: Admission,
}

impl RateGuard {
    /// The admission outcome recorded when the guard was taken
    pub fn admission(&self) -> Admission {
        self.admission
    }
}

impl Drop for RateGuard {
    fn drop(&mut self) {
        self.limiter.release(&self.id);
    }
}
