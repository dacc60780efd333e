//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Clock blackout detection and cached timestamp repair."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adagw_common::{Clock, Shutdown};
use adagw_persistence::PriorityCache;
use tokio::time::sleep;
use tracing::{info, warn};

const DEFAULT_POLL: Duration = Duration::from_secs(1);
const REPAIR_ATTEMPTS: u32 = 5;

/// Whether the wall clock is currently trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Normal,
    Blackout,
}

/// Measures how long the wall clock stays below the epoch floor and, once it
/// recovers, restamps every cached message produced during the blackout.
///
/// Each blackout is handled by one call to [`TimeValidityMonitor::run`]; the
/// task ends after the repair pass.
#[derive(Debug)]
pub struct TimeValidityMonitor {
    clock: Arc<dyn Clock>,
    cache: Arc<PriorityCache>,
    active: AtomicBool,
    /// Monotonic second at which the current blackout began.
    started: AtomicI64,
    poll: Duration,
}

impl TimeValidityMonitor {
    pub fn new(clock: Arc<dyn Clock>, cache: Arc<PriorityCache>) -> Self {
        Self {
            clock,
            cache,
            active: AtomicBool::new(false),
            started: AtomicI64::new(0),
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn state(&self) -> MonitorState {
        if self.is_active() {
            MonitorState::Blackout
        } else {
            MonitorState::Normal
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Enter the blackout state, recording its monotonic start.
    ///
    /// Returns `false` when a blackout is already being tracked; the caller
    /// must only spawn [`TimeValidityMonitor::run`] after a `true`.
    pub fn begin_blackout(&self) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.started
            .store(self.clock.monotonic_secs(), Ordering::SeqCst);
        warn!(wall = self.clock.unix_now(), "clock blackout started");
        true
    }

    /// Seconds since the blackout began, `0` outside a blackout.
    pub fn offset(&self) -> i64 {
        if !self.is_active() {
            return 0;
        }
        self.clock.monotonic_secs() - self.started.load(Ordering::SeqCst)
    }

    /// Poll the clock until it is valid again, then repair the cache.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        loop {
            if self.clock.is_valid() {
                self.recover(&mut shutdown).await;
                break;
            }
            tokio::select! {
                _ = shutdown.triggered() => {
                    info!(offset = self.offset(), "shutdown during clock blackout");
                    break;
                }
                _ = sleep(self.poll) => {}
            }
        }
        self.active.store(false, Ordering::SeqCst);
    }

    async fn recover(&self, shutdown: &mut Shutdown) {
        let blackout = self.offset();
        let now = self.clock.unix_now();
        info!(blackout_secs = blackout, now, "clock recovered");

        for attempt in 1..=REPAIR_ATTEMPTS {
            match self.cache.repair(now, blackout) {
                Ok(_) => {
                    if let Err(err) = self.cache.persist() {
                        warn!(error = %err, "cache store after repair failed");
                    }
                    return;
                }
                Err(err) => warn!(attempt, error = %err, "cache repair postponed"),
            }
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = sleep(self.poll) => {}
            }
        }
        warn!(blackout_secs = blackout, "cached timestamps left unrepaired");
    }
}
