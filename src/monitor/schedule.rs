// SPDX-License-Identifier: MPL-2.0

//! Loop pacing shared by every sampler loop.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Hard minimum gap between two primary polls of the same domain.
pub const MIN_POLL_GAP: Duration = Duration::from_millis(500);

/// Rejects polls that arrive sooner than `min_gap` after the last allowed one.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_gap: Duration,
    last: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MIN_POLL_GAP)
    }
}

impl RateLimiter {
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap, last: None }
    }

    /// Whether a poll may run at `now`. An allowed poll starts a new gap.
    pub fn allow(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.min_gap {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Whether a stop was requested. Loops check this between a slow step (an
/// external tool, a sysinfo scan) and the publish that follows it.
pub fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleep for `period` unless a stop is signalled first.
///
/// Returns `false` once the loop should exit: stop was requested or the
/// controlling side went away.
pub async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if stop_requested(stop) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => !*stop.borrow(),
        changed = stop.changed() => changed.is_ok() && !*stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_rejects_bursts() {
        let mut limiter = RateLimiter::default();
        let t0 = Instant::now();
        assert!(limiter.allow(t0));
        assert!(!limiter.allow(t0 + Duration::from_millis(100)));
        assert!(!limiter.allow(t0 + Duration::from_millis(499)));
        assert!(limiter.allow(t0 + Duration::from_millis(500)));
        // The gap restarts from the last allowed poll.
        assert!(!limiter.allow(t0 + Duration::from_millis(700)));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_stop() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_or_stop(&mut rx, Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { sleep_or_stop(&mut rx, Duration::from_secs(3600)).await });
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_slow_step_is_seen_before_publish() {
        let (tx, rx) = watch::channel(false);
        let step = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            !stop_requested(&rx)
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(!step.await.unwrap(), "a stopped loop must not publish");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_ends_loop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!sleep_or_stop(&mut rx, Duration::from_secs(3600)).await);
    }
}
