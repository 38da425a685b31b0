// Turn latency watchdog (observability only - never alters control flow)

use std::time::{Duration, Instant};
use uuid::Uuid;

/// Measures one turn and warns when it blows the configured budget.
#[derive(Debug)]
pub struct TurnTimer {
    budget: Duration,
    started_at: Instant,
}

impl TurnTimer {
    pub fn start(budget: Duration) -> Self {
        Self {
            budget,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn over_budget(&self) -> bool {
        self.elapsed() > self.budget
    }

    /// Log the turn's latency; warn when over budget.
    pub fn finish(self, session_id: Uuid) -> Duration {
        let elapsed = self.elapsed();
        if elapsed > self.budget {
            log::warn!(
                "[Pipeline] turn for {session_id} took {}ms (budget {}ms)",
                elapsed.as_millis(),
                self.budget.as_millis()
            );
        } else {
            log::debug!(
                "[Pipeline] turn for {session_id} completed in {}ms",
                elapsed.as_millis()
            );
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_timer_is_within_budget() {
        let timer = TurnTimer::start(Duration::from_secs(10));
        assert!(!timer.over_budget());
        assert!(timer.finish(Uuid::nil()) < Duration::from_secs(10));
    }

    #[test]
    fn zero_budget_is_always_exceeded() {
        let timer = TurnTimer::start(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.over_budget());
    }
}
