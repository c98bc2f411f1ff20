// SPDX-License-Identifier: MPL-2.0

//! # Process Attribution Tracker
//!
//! Turns noisy per-poll process snapshots (cumulative counters per process)
//! into a stable "currently active processes" list.
//!
//! ## Per-Poll Algorithm
//!
//! 1. A process seen for the first time only establishes a baseline. Its
//!    cumulative counters cover its whole lifetime, not the last poll, so
//!    attributing them would show a huge fake rate.
//! 2. Otherwise the counter delta is converted to a rate using the fixed
//!    attribution period. Rates above the ceiling are measurement artifacts
//!    and are discarded (the baseline is still updated).
//! 3. Non-zero activity upserts a [`ProcessActivityRecord`]; zero activity
//!    zeroes the current rates of an existing record but keeps it.
//! 4. Records of vanished processes, and records idle for longer than the
//!    attribution window, are evicted.
//!
//! ## Ranking
//!
//! The visible list only contains records with a non-zero current rate and is
//! ordered by current combined rate, highest first. Ties keep discovery order.

use super::delta::{clamp_rate, counter_delta};
use crate::config::PROCESS_COUNT_RANGE;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// How often the attribution loops poll their process sources.
pub const ATTRIBUTION_PERIOD: Duration = Duration::from_secs(2);

/// How long a process stays listed after its last observed activity.
pub const ATTRIBUTION_WINDOW: Duration = Duration::from_secs(10);

// ============================================================================
// Inputs
// ============================================================================

/// Identity of a process across polls. The name guards against pid reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub pid: u32,
    pub name: String,
}

impl ProcessKey {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self { pid, name: name.into() }
    }
}

/// Two cumulative counters per process (read/write, in/out, or cpu time/unused).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessCounters {
    pub primary: u64,
    pub secondary: u64,
}

impl ProcessCounters {
    pub fn new(primary: u64, secondary: u64) -> Self {
        Self { primary, secondary }
    }
}

/// One process as reported by a single poll of a process source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSample {
    pub key: ProcessKey,
    pub counters: ProcessCounters,
}

impl ProcessSample {
    pub fn new(pid: u32, name: impl Into<String>, primary: u64, secondary: u64) -> Self {
        Self {
            key: ProcessKey::new(pid, name),
            counters: ProcessCounters::new(primary, secondary),
        }
    }
}

// ============================================================================
// Records and Published Entries
// ============================================================================

/// Activity history of one process, owned by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessActivityRecord {
    pub pid: u32,
    pub name: String,
    /// Sum of all attributed counter deltas since the record was created
    pub cumulative_activity: u64,
    pub last_active_at: Instant,
    pub current_rate_primary: f64,
    pub current_rate_secondary: f64,
    discovered: u64,
}

impl ProcessActivityRecord {
    pub fn combined_rate(&self) -> f64 {
        self.current_rate_primary + self.current_rate_secondary
    }
}

/// One row of a published top-N list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessActivity {
    pub pid: u32,
    pub name: String,
    pub rate_primary: f64,
    pub rate_secondary: f64,
    pub cumulative_activity: u64,
}

impl ProcessActivity {
    pub fn combined_rate(&self) -> f64 {
        self.rate_primary + self.rate_secondary
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Time-windowed table of per-process activity for one resource domain.
#[derive(Debug)]
pub struct AttributionTracker {
    baselines: HashMap<ProcessKey, ProcessCounters>,
    records: HashMap<ProcessKey, ProcessActivityRecord>,
    next_discovery: u64,
    period: Duration,
    window: Duration,
    ceiling: f64,
    scale: f64,
}

impl AttributionTracker {
    /// Tracker with the default period and window. `ceiling` bounds a sane
    /// per-process rate in the tracker's output unit.
    pub fn new(ceiling: f64) -> Self {
        Self::with_timing(ATTRIBUTION_PERIOD, ATTRIBUTION_WINDOW, ceiling)
    }

    pub fn with_timing(period: Duration, window: Duration, ceiling: f64) -> Self {
        Self {
            baselines: HashMap::new(),
            records: HashMap::new(),
            next_discovery: 0,
            period,
            window,
            ceiling,
            scale: 1.0,
        }
    }

    /// Multiply every per-second delta by `scale` (e.g. cpu-milliseconds to percent).
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Fold one poll's process list into the table.
    pub fn update(&mut self, observed: &[ProcessSample], now: Instant) {
        let period = self.period.as_secs_f64();
        let mut present = HashSet::with_capacity(observed.len());

        for sample in observed {
            present.insert(sample.key.clone());
            let Some(previous) = self.baselines.insert(sample.key.clone(), sample.counters) else {
                continue;
            };
            if period <= 0.0 {
                continue;
            }

            let delta_primary = counter_delta(previous.primary, sample.counters.primary);
            let delta_secondary = counter_delta(previous.secondary, sample.counters.secondary);
            let raw_primary = delta_primary as f64 * self.scale / period;
            let raw_secondary = delta_secondary as f64 * self.scale / period;

            let artifact = raw_primary > self.ceiling || raw_secondary > self.ceiling;
            if artifact {
                log::debug!(
                    "discarding implausible rate for {} ({}): {:.0}/{:.0}",
                    sample.key.name,
                    sample.key.pid,
                    raw_primary,
                    raw_secondary
                );
            }

            let rate_primary = clamp_rate(raw_primary, self.ceiling);
            let rate_secondary = clamp_rate(raw_secondary, self.ceiling);

            if !artifact && rate_primary + rate_secondary > 0.0 {
                let next_discovery = &mut self.next_discovery;
                let record = self.records.entry(sample.key.clone()).or_insert_with(|| {
                    let discovered = *next_discovery;
                    *next_discovery += 1;
                    ProcessActivityRecord {
                        pid: sample.key.pid,
                        name: sample.key.name.clone(),
                        cumulative_activity: 0,
                        last_active_at: now,
                        current_rate_primary: 0.0,
                        current_rate_secondary: 0.0,
                        discovered,
                    }
                });
                record.cumulative_activity = record
                    .cumulative_activity
                    .saturating_add(delta_primary.saturating_add(delta_secondary));
                record.last_active_at = now;
                record.current_rate_primary = rate_primary;
                record.current_rate_secondary = rate_secondary;
            } else if let Some(record) = self.records.get_mut(&sample.key) {
                record.current_rate_primary = 0.0;
                record.current_rate_secondary = 0.0;
            }
        }

        self.baselines.retain(|key, _| present.contains(key));
        let window = self.window;
        self.records.retain(|key, record| {
            present.contains(key) && now.saturating_duration_since(record.last_active_at) <= window
        });
    }

    /// Up to `n` currently active processes, highest combined rate first.
    ///
    /// `n` is clamped to the configured process count range.
    pub fn top(&self, n: usize) -> Vec<ProcessActivity> {
        let n = n.clamp(*PROCESS_COUNT_RANGE.start(), *PROCESS_COUNT_RANGE.end());
        let mut active: Vec<&ProcessActivityRecord> =
            self.records.values().filter(|r| r.combined_rate() > 0.0).collect();
        active.sort_by_key(|r| r.discovered);
        // Stable sort keeps discovery order among equal rates.
        active.sort_by(|a, b| b.combined_rate().total_cmp(&a.combined_rate()));
        active
            .into_iter()
            .take(n)
            .map(|r| ProcessActivity {
                pid: r.pid,
                name: r.name.clone(),
                rate_primary: r.current_rate_primary,
                rate_secondary: r.current_rate_secondary,
                cumulative_activity: r.cumulative_activity,
            })
            .collect()
    }

    pub fn record(&self, key: &ProcessKey) -> Option<&ProcessActivityRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;
    const CEILING: f64 = 1_000.0 * MB as f64;

    fn tracker() -> AttributionTracker {
        AttributionTracker::with_timing(Duration::from_secs(2), Duration::from_secs(10), CEILING)
    }

    #[test]
    fn first_sighting_yields_no_rate() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[ProcessSample::new(10, "backup", 0, 500 * MB)], now);
        assert!(t.is_empty());
        assert!(t.top(5).is_empty());
    }

    #[test]
    fn second_poll_attributes_delta_over_fixed_period() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[ProcessSample::new(10, "backup", 0, 500 * MB)], now);
        t.update(&[ProcessSample::new(10, "backup", 0, 504 * MB)], now + ATTRIBUTION_PERIOD);

        let top = t.top(5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].rate_secondary, 2.0 * MB as f64);
        assert_eq!(top[0].cumulative_activity, 4 * MB);
    }

    #[test]
    fn implausible_rate_is_discarded_but_becomes_baseline() {
        let mut t = AttributionTracker::with_timing(Duration::from_secs(2), Duration::from_secs(10), 100.0);
        let now = Instant::now();
        t.update(&[ProcessSample::new(1, "a", 0, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 10_000, 0)], now);
        assert!(t.is_empty());
        // The artifact reading is the new baseline, so the next delta is small.
        t.update(&[ProcessSample::new(1, "a", 10_020, 0)], now);
        assert_eq!(t.top(5)[0].rate_primary, 10.0);
    }

    #[test]
    fn idle_record_is_kept_but_hidden() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[ProcessSample::new(1, "a", 0, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now + Duration::from_secs(2));

        let key = ProcessKey::new(1, "a");
        let record = t.record(&key).expect("record kept while inside window");
        assert_eq!(record.combined_rate(), 0.0);
        assert!(t.top(5).is_empty());
    }

    #[test]
    fn record_expires_after_window_even_if_running() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[ProcessSample::new(1, "a", 0, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now + Duration::from_secs(11));
        assert!(t.record(&ProcessKey::new(1, "a")).is_none());
    }

    #[test]
    fn vanished_process_is_evicted() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[ProcessSample::new(1, "a", 0, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now);
        t.update(&[ProcessSample::new(2, "b", 0, 0)], now);
        assert!(t.is_empty());
        // And it is a first sighting again if it comes back.
        t.update(&[ProcessSample::new(1, "a", 500, 0)], now);
        assert!(t.is_empty());
    }

    #[test]
    fn ranking_uses_current_rate_and_discovery_order_for_ties() {
        let mut t = tracker();
        let now = Instant::now();
        let base = [
            ProcessSample::new(1, "heavy-history", 0, 0),
            ProcessSample::new(2, "tie-a", 0, 0),
            ProcessSample::new(3, "tie-b", 0, 0),
        ];
        t.update(&base, now);
        t.update(
            &[
                ProcessSample::new(1, "heavy-history", 1_000, 0),
                ProcessSample::new(2, "tie-a", 0, 0),
                ProcessSample::new(3, "tie-b", 0, 0),
            ],
            now,
        );
        t.update(
            &[
                ProcessSample::new(1, "heavy-history", 1_002, 0),
                ProcessSample::new(2, "tie-a", 20, 0),
                ProcessSample::new(3, "tie-b", 20, 0),
            ],
            now,
        );

        let names: Vec<String> = t.top(10).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["tie-a", "tie-b", "heavy-history"]);
    }

    #[test]
    fn resumed_activity_accumulates_without_reset() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[ProcessSample::new(1, "a", 0, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now);
        t.update(&[ProcessSample::new(1, "a", 100, 0)], now + Duration::from_secs(2));
        t.update(&[ProcessSample::new(1, "a", 150, 0)], now + Duration::from_secs(4));
        assert_eq!(t.top(1)[0].cumulative_activity, 150);
    }

    #[test]
    fn top_n_is_clamped() {
        let mut t = tracker();
        let now = Instant::now();
        let zeros: Vec<_> = (0..15).map(|pid| ProcessSample::new(pid, "p", 0, 0)).collect();
        let busy: Vec<_> = (0..15).map(|pid| ProcessSample::new(pid, "p", 10, 0)).collect();
        t.update(&zeros, now);
        t.update(&busy, now);
        assert_eq!(t.top(0).len(), 1);
        assert_eq!(t.top(50).len(), 10);
    }

    #[test]
    fn scale_converts_units() {
        let mut t = AttributionTracker::with_timing(Duration::from_secs(2), Duration::from_secs(10), 800.0)
            .with_scale(0.1);
        let now = Instant::now();
        t.update(&[ProcessSample::new(1, "a", 0, 0)], now);
        // 1000 cpu-ms over 2s is half a core.
        t.update(&[ProcessSample::new(1, "a", 1_000, 0)], now);
        assert_eq!(t.top(1)[0].rate_primary, 50.0);
    }
}
