// =============================================================================
// Watchdog — source-pool health tracking and restarts
// =============================================================================
//
// Three triggers rebuild the source pool:
//   1. a stale series observed while serving stats (rate-limited to one
//      attempt per 5 minutes),
//   2. three consecutive background-cycle errors,
//   3. six hours since the last restart, as a proactive refresh.
//
// A restart swaps in fresh HTTP clients; cached candles keep serving reads
// throughout, so the restart runs off the hot path.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::sources::SourcePool;

const STALE_RESTART_COOLDOWN: Duration = Duration::from_secs(300);
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
const PROACTIVE_RESTART_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug)]
struct WatchdogState {
    consecutive_errors: u32,
    /// Baseline for the proactive timer; stamped at construction and on
    /// every restart.
    last_restart: Instant,
    /// Stamped only by stale-triggered restarts. `None` until the first
    /// sighting, so staleness right after startup restarts immediately.
    last_stale_attempt: Option<Instant>,
    restarts: u64,
}

pub struct Watchdog {
    pool: Arc<SourcePool>,
    stale_cooldown: Duration,
    proactive_interval: Duration,
    state: Mutex<WatchdogState>,
}

impl Watchdog {
    pub fn new(pool: Arc<SourcePool>) -> Self {
        Self::with_timings(pool, STALE_RESTART_COOLDOWN, PROACTIVE_RESTART_INTERVAL)
    }

    fn with_timings(pool: Arc<SourcePool>, stale_cooldown: Duration, proactive_interval: Duration) -> Self {
        Self {
            pool,
            stale_cooldown,
            proactive_interval,
            state: Mutex::new(WatchdogState {
                consecutive_errors: 0,
                last_restart: Instant::now(),
                last_stale_attempt: None,
                restarts: 0,
            }),
        }
    }

    /// A background refresh cycle completed cleanly.
    pub fn record_cycle_success(&self) {
        self.state.lock().consecutive_errors = 0;
    }

    /// A background refresh cycle failed. Three in a row restart the pool.
    pub fn record_cycle_error(&self) {
        let restart = {
            let mut state = self.state.lock();
            state.consecutive_errors += 1;
            warn!(
                consecutive = state.consecutive_errors,
                "background refresh cycle failed"
            );
            state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS
        };
        if restart {
            self.restart("consecutive refresh errors");
        }
    }

    /// A stale series was observed while serving a read. The first sighting
    /// restarts right away; afterwards at most one attempt per cooldown
    /// window, further sightings inside it are ignored.
    pub fn on_stale(&self, key: &str) {
        let due = {
            let mut state = self.state.lock();
            match state.last_stale_attempt {
                Some(at) if at.elapsed() < self.stale_cooldown => false,
                _ => {
                    state.last_stale_attempt = Some(Instant::now());
                    true
                }
            }
        };
        if due {
            warn!(key, "stale series detected, restarting sources");
            self.restart("stale data");
        }
    }

    /// Called once per scheduler cycle; restarts the pool when six hours
    /// have passed since the previous restart.
    pub fn check_proactive(&self) {
        let due = {
            let state = self.state.lock();
            state.last_restart.elapsed() >= self.proactive_interval
        };
        if due {
            self.restart("proactive refresh");
        }
    }

    pub fn restart_count(&self) -> u64 {
        self.state.lock().restarts
    }

    fn restart(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            state.last_restart = Instant::now();
            state.consecutive_errors = 0;
            state.restarts += 1;
        }
        let pool = Arc::clone(&self.pool);
        let reason = reason.to_string();
        // Off the hot path: the caller is serving a request or mid-cycle.
        tokio::spawn(async move {
            pool.restart();
            info!(reason, "source pool restarted");
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn fast_watchdog() -> Watchdog {
        Watchdog::with_timings(
            Arc::new(SourcePool::new()),
            Duration::from_millis(50),
            Duration::from_millis(80),
        )
    }

    #[tokio::test]
    async fn errors_below_threshold_do_not_restart() {
        let wd = fast_watchdog();
        wd.record_cycle_error();
        wd.record_cycle_error();
        assert_eq!(wd.restart_count(), 0);
    }

    #[tokio::test]
    async fn third_consecutive_error_restarts() {
        let wd = fast_watchdog();
        wd.record_cycle_error();
        wd.record_cycle_error();
        wd.record_cycle_error();
        assert_eq!(wd.restart_count(), 1);
        // Counter reset: two more errors stay below the threshold again.
        wd.record_cycle_error();
        wd.record_cycle_error();
        assert_eq!(wd.restart_count(), 1);
    }

    #[tokio::test]
    async fn success_resets_the_error_counter() {
        let wd = fast_watchdog();
        wd.record_cycle_error();
        wd.record_cycle_error();
        wd.record_cycle_success();
        wd.record_cycle_error();
        assert_eq!(wd.restart_count(), 0);
    }

    #[tokio::test]
    async fn first_stale_sighting_restarts_immediately() {
        // No cooldown inherited from startup: stale data observed right
        // after construction triggers a restart at once.
        let wd = fast_watchdog();
        wd.on_stale("BTC_1h");
        assert_eq!(wd.restart_count(), 1);
    }

    #[tokio::test]
    async fn stale_restarts_are_rate_limited() {
        let wd = fast_watchdog();
        wd.on_stale("BTC_1h");
        wd.on_stale("BTC_1h");
        assert_eq!(wd.restart_count(), 1);

        sleep(Duration::from_millis(60)).await;
        wd.on_stale("BTC_1h");
        assert_eq!(wd.restart_count(), 2);
    }

    #[tokio::test]
    async fn proactive_restart_after_interval() {
        let wd = fast_watchdog();
        wd.check_proactive();
        assert_eq!(wd.restart_count(), 0);

        sleep(Duration::from_millis(100)).await;
        wd.check_proactive();
        assert_eq!(wd.restart_count(), 1);
    }
}
