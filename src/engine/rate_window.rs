use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::SchedulerError;

/// Sliding horizon the budget applies to.
pub const RATE_HORIZON: Duration = Duration::from_secs(1);

/// Shortest timer ever armed for a throttled request.
pub const MIN_WAIT: Duration = Duration::from_millis(10);

/// Requests-per-second budget over a sliding one second window.
///
/// The window is checked before issuing a rate-limited request, never after:
/// callers ask [`RateWindow::can_execute`] and only [`RateWindow::record`] once
/// the request has actually gone out.
#[derive(Debug, Clone)]
pub struct RateWindow {
    budget: u32,
    history: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(budget: u32) -> Result<Self, SchedulerError> {
        if budget == 0 {
            return Err(SchedulerError::InvalidBudget(budget));
        }
        Ok(Self {
            budget,
            history: VecDeque::with_capacity(budget as usize),
        })
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Drops timestamps that fell out of the window.
    pub fn purge(&mut self, now: Instant) {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) >= RATE_HORIZON {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn can_execute(&mut self, now: Instant) -> bool {
        self.purge(now);
        self.history.len() as u32 + 1 <= self.budget
    }

    pub fn record(&mut self, now: Instant) {
        self.history.push_back(now);
    }

    /// How long until the oldest timestamp leaves the window.
    pub fn wait_time(&self, now: Instant) -> Duration {
        match self.history.front() {
            Some(&oldest) => RATE_HORIZON
                .saturating_sub(now.duration_since(oldest))
                .max(MIN_WAIT),
            None => MIN_WAIT,
        }
    }

    pub fn in_window(&self) -> usize {
        self.history.len()
    }
}
