//! Rolling end-of-utterance to first-audio latency.

use serde::Serialize;
use std::collections::VecDeque;

/// Summary published in session snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub last_ms: Option<u64>,
    /// Whether mean and p95 are within their configured targets.
    pub within_target: bool,
}

#[derive(Debug)]
pub struct LatencyStats {
    capacity: usize,
    samples: VecDeque<u64>,
    target_mean_ms: u64,
    target_p95_ms: u64,
}

impl LatencyStats {
    pub fn new(capacity: usize, target_mean_ms: u64, target_p95_ms: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
            target_mean_ms,
            target_p95_ms,
        }
    }

    pub fn record(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary {
                within_target: true,
                ..LatencySummary::default()
            };
        }
        let n = self.samples.len();
        let mean = self.samples.iter().sum::<u64>() / n as u64;
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        // Nearest-rank percentile.
        let rank = (n * 95).div_ceil(100).max(1);
        let p95 = sorted[rank - 1];
        LatencySummary {
            samples: n,
            mean_ms: Some(mean),
            p95_ms: Some(p95),
            last_ms: self.samples.back().copied(),
            within_target: mean <= self.target_mean_ms && p95 <= self.target_p95_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_are_within_target() {
        let stats = LatencyStats::new(8, 1_200, 2_000);
        let summary = stats.summary();
        assert_eq!(summary.samples, 0);
        assert!(summary.mean_ms.is_none());
        assert!(summary.within_target);
    }

    #[test]
    fn mean_and_p95() {
        let mut stats = LatencyStats::new(100, 1_200, 2_000);
        for ms in 1..=100 {
            stats.record(ms * 10);
        }
        let summary = stats.summary();
        assert_eq!(summary.mean_ms, Some(505));
        assert_eq!(summary.p95_ms, Some(950));
        assert_eq!(summary.last_ms, Some(1_000));
        assert!(summary.within_target);
    }

    #[test]
    fn window_is_bounded_and_targets_checked() {
        let mut stats = LatencyStats::new(2, 1_200, 2_000);
        stats.record(100);
        stats.record(3_000);
        stats.record(3_000);
        let summary = stats.summary();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.mean_ms, Some(3_000));
        assert!(!summary.within_target);
    }
}
