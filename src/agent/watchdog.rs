//! Agent watchdog with a bounded restart budget
//!
//! Respawns a crashed agent, but at most K restarts inside a sliding window;
//! past the budget the watchdog exits instead of feeding a crash loop. A
//! clean agent exit (code 0) also stops the watchdog; the dedicated restart
//! exit code marks an intentional re-exec that does not count against the
//! budget window any differently than a crash.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::domain_types::{RestartBudget, RestartWindowSecs};
use crate::time_provider::SharedTimeProvider;

/// Exit code the agent uses to request a respawn
pub const RESTART_EXIT_CODE: i32 = 75;

/// Delay between a crash and the respawn
const RESPAWN_DELAY: Duration = Duration::from_secs(5);

/// Sliding-window restart accounting
#[derive(Debug)]
pub struct RestartBudgetTracker {
    budget: RestartBudget,
    window: RestartWindowSecs,
    restarts: VecDeque<DateTime<Utc>>,
}

impl RestartBudgetTracker {
    /// Creates a tracker with the given budget and window
    #[must_use]
    pub fn new(budget: RestartBudget, window: RestartWindowSecs) -> Self {
        Self {
            budget,
            window,
            restarts: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.window.as_duration())
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        while let Some(oldest) = self.restarts.front() {
            if now - *oldest >= window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// True when another restart fits inside the budget
    pub fn can_restart(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        self.restarts.len() < self.budget.as_usize()
    }

    /// Records a restart at `now`
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.restarts.push_back(now);
    }

    /// Restarts currently inside the window
    #[must_use]
    pub fn used(&self) -> usize {
        self.restarts.len()
    }
}

/// Runs the watchdog loop, spawning `program args` until the budget trips
///
/// Returns the exit code the watchdog process should report: 0 after a clean
/// child exit, 1 when the budget is exceeded or the child cannot spawn.
pub async fn run_watchdog(
    program: &str,
    args: &[String],
    budget: RestartBudget,
    window: RestartWindowSecs,
    time: SharedTimeProvider,
) -> i32 {
    let mut tracker = RestartBudgetTracker::new(budget, window);

    loop {
        let now = time.now_utc();
        if !tracker.can_restart(now) {
            error!(
                used = tracker.used(),
                "restart budget exhausted, watchdog exiting"
            );
            return 1;
        }
        tracker.record(now);
        info!(attempt = tracker.used(), %program, "starting agent");

        let child = Command::new(program).args(args).spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to spawn agent");
                return 1;
            }
        };

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "failed waiting on agent");
                return 1;
            }
        };

        match status.code() {
            Some(0) => {
                info!("agent exited cleanly, watchdog done");
                return 0;
            }
            Some(RESTART_EXIT_CODE) => {
                info!("agent requested re-exec");
            }
            code => {
                warn!(?code, "agent crashed");
            }
        }
        time.sleep(RESPAWN_DELAY).await;
    }
}
