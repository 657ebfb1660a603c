//! Per-zone failure detection over a rolling time window.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Thresholds for [`ZoneFailureDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Outcomes older than this are ignored.
    pub window: Duration,

    /// Minimum failures inside the window before a zone can be avoided.
    pub min_failures: u32,

    /// Zone is avoided once failures / outcomes exceeds this (0.0 to 1.0).
    pub max_failure_proportion: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10 * 60),
            min_failures: 3,
            max_failure_proportion: 0.5,
        }
    }
}

/// Outcome counts inside the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStats {
    pub successes: u32,
    pub failures: u32,
}

impl ZoneStats {
    pub fn total(&self) -> u32 {
        self.successes + self.failures
    }

    pub fn failure_proportion(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => f64::from(self.failures) / f64::from(total),
        }
    }
}

/// Tracks start outcomes per zone and flags zones to avoid.
///
/// A zone is avoided while, among outcomes recorded within `window`, there
/// are at least `min_failures` failures and the failure proportion exceeds
/// `max_failure_proportion`. It becomes eligible again once those failures
/// age out of the window.
#[derive(Debug, Clone, Default)]
pub struct ZoneFailureDetector {
    config: DetectorConfig,

    /// zone key -> (recorded_at, succeeded), oldest first.
    outcomes: BTreeMap<String, VecDeque<(Instant, bool)>>,
}

impl ZoneFailureDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn record_success(&mut self, zone: &str) {
        self.record_at(zone, true, Instant::now());
    }

    pub fn record_failure(&mut self, zone: &str) {
        self.record_at(zone, false, Instant::now());
    }

    /// Record an outcome at an explicit instant.
    pub fn record_at(&mut self, zone: &str, succeeded: bool, at: Instant) {
        let window = self.config.window;
        let entries = self.outcomes.entry(zone.to_string()).or_default();
        entries.push_back((at, succeeded));

        while let Some((first, _)) = entries.front() {
            if at.saturating_duration_since(*first) > window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn has_failed(&self, zone: &str) -> bool {
        self.has_failed_at(zone, Instant::now())
    }

    /// Whether `zone` should be avoided as seen at `now`.
    pub fn has_failed_at(&self, zone: &str, now: Instant) -> bool {
        let stats = self.stats_at(zone, now);
        stats.failures >= self.config.min_failures.max(1)
            && stats.failure_proportion() > self.config.max_failure_proportion
    }

    pub fn stats_at(&self, zone: &str, now: Instant) -> ZoneStats {
        let window = self.config.window;
        let mut stats = ZoneStats::default();

        for (at, succeeded) in self.outcomes.get(zone).into_iter().flatten() {
            if now.saturating_duration_since(*at) > window {
                continue;
            }
            if *succeeded {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }

        stats
    }

    /// Zones among `zones` currently avoided.
    pub fn failed_zones<'a, I>(&self, zones: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Instant::now();
        zones
            .into_iter()
            .filter(|z| self.has_failed_at(z, now))
            .map(str::to_string)
            .collect()
    }

    /// Drop outcomes that fell out of the window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.config.window;
        for entries in self.outcomes.values_mut() {
            entries.retain(|(at, _)| now.saturating_duration_since(*at) <= window);
        }
        self.outcomes.retain(|_, entries| !entries.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn detector(window_secs: u64, min_failures: u32, proportion: f64) -> ZoneFailureDetector {
        ZoneFailureDetector::new(DetectorConfig {
            window: Duration::from_secs(window_secs),
            min_failures,
            max_failure_proportion: proportion,
        })
    }

    #[test]
    fn fresh_zone_is_healthy() {
        let d = ZoneFailureDetector::default();
        assert!(!d.has_failed("zone-a"));
    }

    #[test]
    fn needs_minimum_failures() {
        let mut d = detector(60, 3, 0.5);
        let t0 = Instant::now();
        d.record_at("zone-a", false, t0);
        d.record_at("zone-a", false, t0);
        assert!(!d.has_failed_at("zone-a", t0));

        d.record_at("zone-a", false, t0);
        assert!(d.has_failed_at("zone-a", t0));
    }

    #[test]
    fn successes_dilute_failures() {
        let mut d = detector(60, 2, 0.5);
        let t0 = Instant::now();
        for _ in 0..2 {
            d.record_at("zone-a", false, t0);
        }
        for _ in 0..2 {
            d.record_at("zone-a", true, t0);
        }
        // 2 of 4 is not above one half.
        assert!(!d.has_failed_at("zone-a", t0));
        assert_eq!(
            d.stats_at("zone-a", t0),
            ZoneStats {
                successes: 2,
                failures: 2
            }
        );
    }

    #[test]
    fn failures_age_out_of_window() {
        let mut d = detector(10, 1, 0.5);
        let t0 = Instant::now();
        d.record_at("zone-a", false, t0);
        assert!(d.has_failed_at("zone-a", t0 + Duration::from_secs(5)));
        assert!(!d.has_failed_at("zone-a", t0 + Duration::from_secs(11)));
    }

    #[test]
    fn zones_are_independent() {
        let mut d = detector(60, 1, 0.0);
        d.record_failure("zone-a");
        d.record_success("zone-b");
        assert_eq!(d.failed_zones(["zone-a", "zone-b"]), vec!["zone-a".to_string()]);
    }

    #[test]
    fn prune_drops_empty_zones() {
        let mut d = detector(0, 1, 0.0);
        d.record_at("zone-a", false, Instant::now() - Duration::from_secs(1));
        d.prune();
        assert_eq!(d.stats_at("zone-a", Instant::now()).total(), 0);
    }

    proptest! {
        #[test]
        fn never_failed_without_failures(successes in 0u32..50) {
            let mut d = detector(60, 0, 0.0);
            let t0 = Instant::now();
            for _ in 0..successes {
                d.record_at("zone", true, t0);
            }
            prop_assert!(!d.has_failed_at("zone", t0));
        }
    }
}
