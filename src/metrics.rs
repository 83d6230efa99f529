//! Pool Metrics
//!
//! Prometheus counters for allocation outcomes, kept on a private registry
//! so several services (and tests) can live in one process.

use crate::domain::ports::PoolKind;
use crate::error::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Take outcome label values
pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_REUSED: &str = "reused";
pub const OUTCOME_EXHAUSTED: &str = "exhausted";
pub const OUTCOME_CONTENTION: &str = "contention";
pub const OUTCOME_RELEASED: &str = "released";
pub const OUTCOME_NOT_ALLOCATED: &str = "not_allocated";

/// Allocator metrics
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Registry,
    takes: IntCounterVec,
    releases: IntCounterVec,
    contention_retries: IntCounterVec,
    take_attempts: Histogram,
    range_entries: IntCounterVec,
    mac_pairs: IntCounter,
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetrics")
            .field("mac_pairs", &self.mac_pairs.get())
            .finish()
    }
}

impl PoolMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("netpool".to_string()), None)?;

        let takes = IntCounterVec::new(
            Opts::new("take_total", "Take operations by pool kind and outcome"),
            &["kind", "outcome"],
        )?;
        let releases = IntCounterVec::new(
            Opts::new("release_total", "Release operations by pool kind and outcome"),
            &["kind", "outcome"],
        )?;
        let contention_retries = IntCounterVec::new(
            Opts::new(
                "contention_retries_total",
                "Take candidates lost to a concurrent transaction or lock timeout",
            ),
            &["kind"],
        )?;
        let take_attempts = Histogram::with_opts(
            HistogramOpts::new("take_attempts", "Candidates tried per successful take")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0]),
        )?;
        let range_entries = IntCounterVec::new(
            Opts::new("range_entries_total", "Entries provisioned or deleted by range operations"),
            &["kind", "op"],
        )?;
        let mac_pairs = IntCounter::new("mac_pairs_total", "MAC address pairs generated")?;

        registry.register(Box::new(takes.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(contention_retries.clone()))?;
        registry.register(Box::new(take_attempts.clone()))?;
        registry.register(Box::new(range_entries.clone()))?;
        registry.register(Box::new(mac_pairs.clone()))?;

        Ok(Self {
            registry,
            takes,
            releases,
            contention_retries,
            take_attempts,
            range_entries,
            mac_pairs,
        })
    }

    #[inline]
    pub fn record_take(&self, kind: PoolKind, outcome: &str) {
        self.takes.with_label_values(&[kind.as_str(), outcome]).inc();
    }

    #[inline]
    pub fn record_take_attempts(&self, attempts: u32) {
        self.take_attempts.observe(attempts as f64);
    }

    #[inline]
    pub fn record_contention_retry(&self, kind: PoolKind) {
        self.contention_retries.with_label_values(&[kind.as_str()]).inc();
    }

    #[inline]
    pub fn record_release(&self, kind: PoolKind, outcome: &str, count: u64) {
        self.releases
            .with_label_values(&[kind.as_str(), outcome])
            .inc_by(count);
    }

    #[inline]
    pub fn record_range(&self, kind: PoolKind, op: &str, count: u64) {
        self.range_entries
            .with_label_values(&[kind.as_str(), op])
            .inc_by(count);
    }

    #[inline]
    pub fn record_mac_pair(&self) {
        self.mac_pairs.inc();
    }

    /// Current count for a take outcome
    pub fn takes(&self, kind: PoolKind, outcome: &str) -> u64 {
        self.takes.with_label_values(&[kind.as_str(), outcome]).get()
    }

    /// Current count for a release outcome
    pub fn releases(&self, kind: PoolKind, outcome: &str) -> u64 {
        self.releases.with_label_values(&[kind.as_str(), outcome]).get()
    }

    pub fn contention_retries(&self, kind: PoolKind) -> u64 {
        self.contention_retries.with_label_values(&[kind.as_str()]).get()
    }

    pub fn mac_pairs(&self) -> u64 {
        self.mac_pairs.get()
    }

    /// Text exposition of every metric
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_exposition() {
        let metrics = PoolMetrics::new().unwrap();
        metrics.record_take(PoolKind::PodVlan, OUTCOME_OK);
        metrics.record_take(PoolKind::PodVlan, OUTCOME_OK);
        metrics.record_take(PoolKind::PodVlan, OUTCOME_EXHAUSTED);
        metrics.record_release(PoolKind::PrivateIp, OUTCOME_NOT_ALLOCATED, 1);
        metrics.record_mac_pair();

        assert_eq!(metrics.takes(PoolKind::PodVlan, OUTCOME_OK), 2);
        assert_eq!(metrics.takes(PoolKind::PodVlan, OUTCOME_EXHAUSTED), 1);
        assert_eq!(metrics.releases(PoolKind::PrivateIp, OUTCOME_NOT_ALLOCATED), 1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("netpool_take_total"));
        assert!(text.contains("netpool_mac_pairs_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = PoolMetrics::new().unwrap();
        let b = PoolMetrics::new().unwrap();
        a.record_mac_pair();
        assert_eq!(a.mac_pairs(), 1);
        assert_eq!(b.mac_pairs(), 0);
    }
}
