use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Grace added past `next_block_due` before a view change fires.
pub const VIEW_CHANGE_GRACE: Duration = Duration::from_secs(2);

/// Drives the two clocks of a consensus round: the block cadence (finalize
/// no earlier than `next_block_due`, so fast rounds do not compress the
/// chain) and the view-change deadline with exponential backoff when
/// leaders keep failing.
#[derive(Debug)]
pub struct ConsensusTimer {
    block_time: Duration,
    next_block_due: Instant,
    view_deadline: Instant,
    consecutive_view_changes: u32,
}

impl ConsensusTimer {
    pub fn new(block_time: Duration) -> Self {
        let now = Instant::now();
        Self {
            block_time,
            next_block_due: now + block_time,
            view_deadline: now + block_time + VIEW_CHANGE_GRACE,
            consecutive_view_changes: 0,
        }
    }

    pub fn next_block_due(&self) -> Instant {
        self.next_block_due
    }

    /// Restarts the block clock: the next block is due one block time from
    /// now. Called when a proposal goes out and again after finalization.
    pub fn schedule_next_block(&mut self) {
        self.next_block_due = Instant::now() + self.block_time;
        self.reset_view_deadline();
    }

    /// A block committed: clear the backoff and restart both clocks.
    pub fn on_block_committed(&mut self) {
        self.consecutive_view_changes = 0;
        self.schedule_next_block();
    }

    /// A view change fired: back off the next deadline exponentially,
    /// capped at 2^6 block times, so a partitioned committee converges on
    /// a live leader instead of thrashing.
    pub fn on_view_change(&mut self) {
        self.consecutive_view_changes = self.consecutive_view_changes.saturating_add(1);
        self.reset_view_deadline();
    }

    fn reset_view_deadline(&mut self) {
        let shift = self.consecutive_view_changes.min(6);
        let backoff = self.block_time.saturating_mul(1u32 << shift);
        self.view_deadline = Instant::now() + backoff + VIEW_CHANGE_GRACE;
    }

    pub fn view_deadline(&self) -> Instant {
        self.view_deadline
    }

    /// Sleeps until finalization is allowed.
    pub fn finalize_sleep(&self) -> Sleep {
        tokio::time::sleep_until(self.next_block_due)
    }

    /// Sleeps until the view-change deadline.
    pub fn view_change_sleep(&self) -> Sleep {
        tokio::time::sleep_until(self.view_deadline)
    }

    pub fn consecutive_view_changes(&self) -> u32 {
        self.consecutive_view_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn block_clock_advances_by_block_time() {
        let block_time = Duration::from_secs(8);
        let mut timer = ConsensusTimer::new(block_time);

        let first_due = timer.next_block_due();
        tokio::time::advance(Duration::from_secs(3)).await;
        timer.schedule_next_block();
        assert!(
            timer.next_block_due() >= first_due,
            "rescheduling from a later now never moves the deadline backwards"
        );
        assert_eq!(timer.next_block_due() - Instant::now(), block_time);
    }

    #[tokio::test(start_paused = true)]
    async fn view_deadline_backs_off_and_resets() {
        let block_time = Duration::from_secs(8);
        let mut timer = ConsensusTimer::new(block_time);

        timer.on_view_change();
        let after_one = timer.view_deadline() - Instant::now();
        assert_eq!(after_one, block_time * 2 + VIEW_CHANGE_GRACE);

        timer.on_view_change();
        let after_two = timer.view_deadline() - Instant::now();
        assert_eq!(after_two, block_time * 4 + VIEW_CHANGE_GRACE);
        assert_eq!(timer.consecutive_view_changes(), 2);

        timer.on_block_committed();
        assert_eq!(timer.consecutive_view_changes(), 0);
        assert_eq!(timer.view_deadline() - Instant::now(), block_time + VIEW_CHANGE_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let block_time = Duration::from_secs(8);
        let mut timer = ConsensusTimer::new(block_time);
        for _ in 0..40 {
            timer.on_view_change();
        }
        let remaining = timer.view_deadline() - Instant::now();
        assert_eq!(remaining, block_time * 64 + VIEW_CHANGE_GRACE);
    }
}
