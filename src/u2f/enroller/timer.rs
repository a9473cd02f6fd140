use std::{cell::Cell, rc::Rc, time::Duration};

use tokio::time::Instant;

/// Single-shot countdown towards a fixed deadline.
///
/// Copies made with `Clone` share cancellation; `clone_timer` starts a fresh,
/// independent timer towards the same deadline.
#[derive(Debug, Clone)]
pub struct Countdown {
    deadline: Instant,
    cancelled: Rc<Cell<bool>>,
}

impl Countdown {
    pub fn new(timeout: Duration) -> Self {
        Self::until(Instant::now() + timeout)
    }

    pub fn until(deadline: Instant) -> Self {
        Countdown {
            deadline,
            cancelled: Rc::new(Cell::new(false)),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn millis_remaining(&self) -> u64 {
        self.deadline.saturating_duration_since(Instant::now()).as_millis() as u64
    }

    pub fn clone_timer(&self) -> Countdown {
        Self::until(self.deadline)
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Resolves at the deadline. A cancelled timer never resolves.
    pub async fn expiry(&self) {
        if !self.is_cancelled() {
            tokio::time::sleep_until(self.deadline).await;
        }

        if self.is_cancelled() {
            std::future::pending::<()>().await;
        }
    }
}
