pub mod backfill;
pub mod bidirectional;
pub mod diagnostic;
pub mod id_repair;

use std::time::Duration;
use tokio::time::Instant;

/// The safety margin each orchestrator leaves inside its budget for the
/// final checkpoint write before returning a resume cursor.
pub const BUDGET_SAFETY_MARGIN: Duration = Duration::from_secs(10);

/// Wall-clock budget for one orchestrator invocation. Checked between
/// chunks; a chunk in flight always runs to completion.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
    margin: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self::with_margin(budget, BUDGET_SAFETY_MARGIN)
    }

    pub fn with_margin(budget: Duration, margin: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
            margin,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() + self.margin >= self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fresh_deadline_has_headroom() {
        let deadline = Deadline::new(Duration::from_secs(120));
        assert!(!deadline.exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_trips_before_the_budget_by_the_margin() {
        let deadline = Deadline::new(Duration::from_secs(120));
        tokio::time::sleep(Duration::from_secs(109)).await;
        assert!(!deadline.exhausted());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(deadline.exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_smaller_than_margin_is_immediately_exhausted() {
        let deadline = Deadline::new(Duration::from_secs(5));
        assert!(deadline.exhausted());
    }
}
