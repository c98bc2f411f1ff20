// SPDX-License-Identifier: MPL-2.0

//! # Counter Delta Engine
//!
//! Turns pairs of cumulative OS counter readings into per-second rates.
//!
//! ## Reset Semantics
//!
//! OS counters are monotonic until they are not: a driver reload, an interface
//! going down, or a 32-bit wrap will make the next reading smaller than the
//! previous one. A decrease is treated as a reset, so the new value is taken as
//! everything accrued since the reset:
//!
//! ```text
//! delta = current >= previous ? current - previous : current
//! ```
//!
//! ## Clamping
//!
//! Every rate leaves this module inside `[0, ceiling]`. Elapsed time is taken
//! from the real timestamps, never from the nominal poll interval, and a pair
//! with no elapsed time yields `None` so the caller skips the cycle entirely.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// Ceiling for byte rates: 10 Gbps expressed in bytes per second.
pub const MAX_BYTE_RATE: f64 = 10_000_000_000.0 / 8.0;

/// Number of points kept per metric for history graphs.
pub const HISTORY_LEN: usize = 60;

// ============================================================================
// Readings and Samples
// ============================================================================

/// One timestamped cumulative counter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterReading {
    pub at: Instant,
    pub value: u64,
}

impl CounterReading {
    pub fn new(at: Instant, value: u64) -> Self {
        Self { at, value }
    }
}

/// Unit of a published rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    BytesPerSecond,
    Percent,
}

/// A derived, clamped rate value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSample {
    pub value: f64,
    pub unit: Unit,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RateSample {
    /// Build a sample stamped with the current wall-clock time.
    ///
    /// Negative and non-finite inputs are stored as `0.0`.
    pub fn now(value: f64, unit: Unit) -> Self {
        let value = if value.is_finite() { value.max(0.0) } else { 0.0 };
        Self {
            value,
            unit,
            timestamp: chrono::Utc::now(),
        }
    }
}

// ============================================================================
// Pure Delta Functions
// ============================================================================

/// Difference between two cumulative values, treating a decrease as a reset.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

/// Clamp a raw rate into `[0, ceiling]`. NaN becomes zero.
pub fn clamp_rate(rate: f64, ceiling: f64) -> f64 {
    if rate.is_nan() {
        return 0.0;
    }
    rate.clamp(0.0, ceiling)
}

/// Per-second rate between two readings, clamped to `[0, ceiling]`.
///
/// Returns `None` when no time elapsed between the readings (or the clock went
/// backwards), in which case the poll must be discarded.
pub fn rate_between(previous: &CounterReading, current: &CounterReading, ceiling: f64) -> Option<f64> {
    let elapsed = current.at.checked_duration_since(previous.at)?.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    let delta = counter_delta(previous.value, current.value);
    Some(clamp_rate(delta as f64 / elapsed, ceiling))
}

/// Percentage `part / total * 100`, clamped to `[0, 100]`. Zero total gives 0.
pub fn percent(part: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    clamp_rate(part / total * 100.0, 100.0)
}

/// Two counters sampled together (rx/tx, read/write) and their last baseline.
#[derive(Debug, Clone, Copy)]
pub struct CounterPair {
    previous: Option<(CounterReading, CounterReading)>,
    ceiling: f64,
}

impl CounterPair {
    pub fn new(ceiling: f64) -> Self {
        Self { previous: None, ceiling }
    }

    /// Fold in one poll and return both rates once a baseline exists.
    ///
    /// The first poll only sets the baseline. A poll with no elapsed time is
    /// discarded and the older baseline kept.
    pub fn update(&mut self, at: Instant, first: u64, second: u64) -> Option<(f64, f64)> {
        let current = (CounterReading::new(at, first), CounterReading::new(at, second));
        let Some((prev_first, prev_second)) = self.previous else {
            self.previous = Some(current);
            return None;
        };
        let rates = (
            rate_between(&prev_first, &current.0, self.ceiling)?,
            rate_between(&prev_second, &current.1, self.ceiling)?,
        );
        self.previous = Some(current);
        Some(rates)
    }

    pub fn baseline(&self) -> Option<(CounterReading, CounterReading)> {
        self.previous
    }
}

// ============================================================================
// Rolling History
// ============================================================================

/// Fixed-capacity ring of recent samples, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    samples: VecDeque<RateSample>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_LEN)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append the newest sample, dropping the oldest when full.
    pub fn push(&mut self, sample: RateSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&RateSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateSample> {
        self.samples.iter()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delta_of_increasing_counter() {
        assert_eq!(counter_delta(100, 150), 50);
        assert_eq!(counter_delta(7, 7), 0);
    }

    #[test]
    fn decrease_is_a_reset() {
        assert_eq!(counter_delta(1_000, 40), 40);
        assert_eq!(counter_delta(u64::MAX, 0), 0);
    }

    #[test]
    fn rate_uses_real_elapsed_time() {
        let t0 = Instant::now();
        let prev = CounterReading::new(t0, 1_000);
        let curr = CounterReading::new(t0 + Duration::from_millis(2_000), 3_000);
        assert_eq!(rate_between(&prev, &curr, MAX_BYTE_RATE), Some(1_000.0));
    }

    #[test]
    fn rate_is_clamped_to_ceiling() {
        let t0 = Instant::now();
        let prev = CounterReading::new(t0, 0);
        let curr = CounterReading::new(t0 + Duration::from_secs(1), u64::MAX);
        assert_eq!(rate_between(&prev, &curr, MAX_BYTE_RATE), Some(MAX_BYTE_RATE));
    }

    #[test]
    fn zero_elapsed_is_discarded() {
        let t0 = Instant::now();
        let prev = CounterReading::new(t0, 0);
        let curr = CounterReading::new(t0, 500);
        assert_eq!(rate_between(&prev, &curr, MAX_BYTE_RATE), None);
        // Clock going backwards is discarded too.
        let later = CounterReading::new(t0 + Duration::from_secs(1), 0);
        assert_eq!(rate_between(&later, &prev, MAX_BYTE_RATE), None);
    }

    #[test]
    fn percent_handles_degenerate_totals() {
        assert_eq!(percent(5.0, 0.0), 0.0);
        assert_eq!(percent(150.0, 100.0), 100.0);
        assert!((percent(1.0, 3.0) - 33.333).abs() < 0.01);
    }

    #[test]
    fn pair_first_poll_is_baseline_only() {
        let mut pair = CounterPair::new(MAX_BYTE_RATE);
        let t0 = Instant::now();
        assert_eq!(pair.update(t0, 100, 200), None);
        assert_eq!(pair.update(t0 + Duration::from_secs(2), 300, 1_200), Some((100.0, 500.0)));
    }

    #[test]
    fn pair_keeps_old_baseline_on_zero_elapsed() {
        let mut pair = CounterPair::new(MAX_BYTE_RATE);
        let t0 = Instant::now();
        pair.update(t0, 0, 0);
        let t1 = t0 + Duration::from_secs(1);
        pair.update(t1, 1_000, 1_000);

        assert_eq!(pair.update(t1, 5_000, 5_000), None);
        assert_eq!(pair.baseline().map(|(a, _)| (a.at, a.value)), Some((t1, 1_000)));
        // The next poll measures across the full gap from the kept baseline.
        assert_eq!(pair.update(t1 + Duration::from_secs(2), 3_000, 1_000), Some((1_000.0, 0.0)));
    }

    #[test]
    fn pair_handles_reset_and_clamp() {
        let mut pair = CounterPair::new(1_000.0);
        let t0 = Instant::now();
        pair.update(t0, 10_000, 0);
        // First counter reset to 40; second jumped far past the ceiling.
        let rates = pair.update(t0 + Duration::from_secs(1), 40, 1_000_000);
        assert_eq!(rates, Some((40.0, 1_000.0)));
    }

    #[test]
    fn history_drops_oldest() {
        let mut history = History::with_capacity(3);
        for v in 0..5 {
            history.push(RateSample::now(v as f64, Unit::Percent));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.values(), vec![2.0, 3.0, 4.0]);
        assert_eq!(history.latest().map(|s| s.value), Some(4.0));
    }

    #[test]
    fn negative_sample_is_stored_as_zero() {
        assert_eq!(RateSample::now(-4.0, Unit::BytesPerSecond).value, 0.0);
        assert_eq!(RateSample::now(f64::NAN, Unit::Percent).value, 0.0);
    }
}
