//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Shared primitives and utilities for the gateway runtime."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

/// Mutex whose acquisitions always carry a deadline.
///
/// Shared gateway structures never block indefinitely: a caller that cannot
/// get the lock within its budget skips the work and retries on its next tick.
#[derive(Debug, Default)]
pub struct TimedMutex<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    /// Acquire within `budget`, logging a warning and returning `None` on timeout.
    pub fn lock_within(&self, budget: Duration) -> Option<MutexGuard<'_, T>> {
        let guard = self.inner.try_lock_for(budget);
        if guard.is_none() {
            warn!(lock = self.name, budget_ms = budget.as_millis() as u64, "lock acquisition timed out");
        }
        guard
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
