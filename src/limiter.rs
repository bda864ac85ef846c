use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Reserve-a-slot rate limiter: each caller reserves the next send slot and
/// sleeps until it arrives, spacing calls at least `interval` apart.
#[derive(Debug)]
pub struct IntervalLimiter {
    inner: Mutex<Slots>,
}

#[derive(Debug)]
struct Slots {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Slots {
                interval,
                next: Instant::now(),
            }),
        }
    }

    /// Wait until the next free slot. Safe to call from many tasks; slots are
    /// handed out in lock acquisition order.
    pub async fn acquire(&self) {
        let wait = {
            let mut slots = self.inner.lock().await;
            let now = Instant::now();
            let start = if now >= slots.next { now } else { slots.next };
            slots.next = start + slots.interval;
            start.saturating_duration_since(now)
        };
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spaces_consecutive_calls() {
        let limiter = IntervalLimiter::new(Duration::from_millis(20));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // third call cannot start earlier than two full intervals in
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn idle_limiter_does_not_wait() {
        let limiter = IntervalLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
