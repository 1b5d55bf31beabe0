//! Per-session latency statistics

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

/// Running count/min/max/mean of a latency series
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    count: u64,
    total: i128,
    min: i64,
    max: i64,
}

impl LatencySummary {
    pub fn record(&mut self, lag_ms: i64) {
        if self.count == 0 {
            self.min = lag_ms;
            self.max = lag_ms;
        } else {
            self.min = self.min.min(lag_ms);
            self.max = self.max.max(lag_ms);
        }
        self.count += 1;
        self.total += i128::from(lag_ms);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<i64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<i64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total as f64 / self.count as f64)
    }
}

/// Statistics for one monitor since it started
#[derive(Debug, Clone)]
pub struct SessionStats {
    started: Instant,
    swaps: LatencySummary,
    pools: LatencySummary,
    chains: BTreeMap<String, LatencySummary>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            swaps: LatencySummary::default(),
            pools: LatencySummary::default(),
            chains: BTreeMap::new(),
        }
    }

    pub fn record_swap(&mut self, chain: &str, lag_ms: i64) {
        self.swaps.record(lag_ms);
        self.record_chain(chain, lag_ms);
    }

    pub fn record_pool(&mut self, chain: &str, lag_ms: i64) {
        self.pools.record(lag_ms);
        self.record_chain(chain, lag_ms);
    }

    fn record_chain(&mut self, chain: &str, lag_ms: i64) {
        self.chains.entry(chain.to_string()).or_default().record(lag_ms);
    }

    pub fn total_events(&self) -> u64 {
        self.swaps.count + self.pools.count
    }

    pub fn swaps(&self) -> &LatencySummary {
        &self.swaps
    }

    pub fn pools(&self) -> &LatencySummary {
        &self.pools
    }

    pub fn chain(&self, chain: &str) -> Option<&LatencySummary> {
        self.chains.get(chain)
    }

    pub fn log_summary(&self, tag: &str) {
        info!(
            "[{}] Session summary: {} event(s) in {}s",
            tag,
            self.total_events(),
            self.started.elapsed().as_secs()
        );
        log_series(tag, "swaps", &self.swaps);
        log_series(tag, "pools", &self.pools);
        for (chain, summary) in &self.chains {
            log_series(tag, chain, summary);
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

fn log_series(tag: &str, label: &str, summary: &LatencySummary) {
    if let (Some(avg), Some(min), Some(max)) = (summary.average(), summary.min(), summary.max()) {
        info!(
            "[{}]   {}: count={} avg={:.0}ms min={}ms max={}ms",
            tag,
            label,
            summary.count(),
            avg,
            min,
            max
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let summary = LatencySummary::default();
        assert_eq!(summary.count(), 0);
        assert_eq!(summary.average(), None);
        assert_eq!(summary.min(), None);
    }

    #[test]
    fn test_summary_tracks_extremes() {
        let mut summary = LatencySummary::default();
        for lag in [300, -20, 1500] {
            summary.record(lag);
        }
        assert_eq!(summary.count(), 3);
        assert_eq!(summary.min(), Some(-20));
        assert_eq!(summary.max(), Some(1500));
        assert!((summary.average().unwrap() - 593.333).abs() < 0.01);
    }

    #[test]
    fn test_session_by_kind_and_chain() {
        let mut stats = SessionStats::new();
        stats.record_swap("solana", 100);
        stats.record_swap("bnb", 300);
        stats.record_pool("solana", 2000);

        assert_eq!(stats.total_events(), 3);
        assert_eq!(stats.swaps().count(), 2);
        assert_eq!(stats.pools().average(), Some(2000.0));
        assert_eq!(stats.chain("solana").unwrap().average(), Some(1050.0));
        assert!(stats.chain("base").is_none());
    }
}
