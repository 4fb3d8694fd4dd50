//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics with Relaxed ordering. They are statistical only
//! and never drive control flow.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for observe latency (microseconds),
/// plus one overflow bucket above the last bound
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = BUCKET_BOUNDS.len() + 1;
/// Reported for percentiles landing in the overflow bucket
const OVERFLOW_BOUND: u64 = 51_200;

/// Observe latencies since the last snapshot
struct LatencyWindow {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; NUM_BUCKETS],
}

struct LatencySnapshot {
    count: u64,
    sum_us: u64,
    max_us: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        let idx = BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the window
    fn take(&self) -> LatencySnapshot {
        LatencySnapshot {
            count: self.count.swap(0, Ordering::Relaxed),
            sum_us: self.sum_us.swap(0, Ordering::Relaxed),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
        }
    }
}

impl LatencySnapshot {
    fn avg_us(&self) -> u64 {
        self.sum_us.checked_div(self.count).unwrap_or(0)
    }

    /// Upper bound of the bucket holding quantile `q`
    fn quantile_bound(&self, q: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let target = (total as f64 * q) as u64;
        let mut seen = 0u64;
        for (idx, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= target {
                return BUCKET_BOUNDS.get(idx).copied().unwrap_or(OVERFLOW_BOUND);
            }
        }
        OVERFLOW_BOUND
    }
}

pub struct Metrics {
    /// Reports accepted by the engine (monotonic)
    reports_total: AtomicU64,
    latency: LatencyWindow,
    reports_rejected: AtomicU64,
    zone_entries: AtomicU64,
    zone_exits: AtomicU64,
    zone_changes: AtomicU64,
    charges_completed: AtomicU64,
    charges_pending: AtomicU64,
    charges_cancelled: AtomicU64,
    reconciliations: AtomicU64,
    reconciled_charges: AtomicU64,
    /// Minor currency units collected through reconciliation
    reconciled_amount: AtomicU64,
    stale_journeys_cancelled: AtomicU64,
    journeys_cancelled: AtomicU64,
    segments_filtered: AtomicU64,
    settlement_failures: AtomicU64,
    lock_conflicts: AtomicU64,
    lookup_failures: AtomicU64,
    egress_dropped: AtomicU64,
    /// Pending dispatcher messages (sampled)
    dispatch_queue_depth: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            reports_total: AtomicU64::new(0),
            latency: LatencyWindow::new(),
            reports_rejected: AtomicU64::new(0),
            zone_entries: AtomicU64::new(0),
            zone_exits: AtomicU64::new(0),
            zone_changes: AtomicU64::new(0),
            charges_completed: AtomicU64::new(0),
            charges_pending: AtomicU64::new(0),
            charges_cancelled: AtomicU64::new(0),
            reconciliations: AtomicU64::new(0),
            reconciled_charges: AtomicU64::new(0),
            reconciled_amount: AtomicU64::new(0),
            stale_journeys_cancelled: AtomicU64::new(0),
            journeys_cancelled: AtomicU64::new(0),
            segments_filtered: AtomicU64::new(0),
            settlement_failures: AtomicU64::new(0),
            lock_conflicts: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            dispatch_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one processed report with its observe latency
    #[inline]
    pub fn record_report_processed(&self, latency_us: u64) {
        self.reports_total.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency_us);
    }

    #[inline]
    pub fn record_report_rejected(&self) {
        self.reports_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_entry(&self) {
        self.zone_entries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit(&self) {
        self.zone_exits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_change(&self) {
        self.zone_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a newly created charge, completed or pending
    #[inline]
    pub fn record_charge(&self, completed: bool) {
        if completed {
            self.charges_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.charges_pending.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_charge_cancelled(&self) {
        self.charges_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconciliation(&self, settled: u64, amount_minor: u64) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        self.reconciled_charges.fetch_add(settled, Ordering::Relaxed);
        self.reconciled_amount.fetch_add(amount_minor, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_journey_cancelled(&self, stale: bool) {
        self.journeys_cancelled.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale_journeys_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_segments_filtered(&self, count: u64) {
        self.segments_filtered.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_settlement_failure(&self) {
        self.settlement_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lookup_failure(&self) {
        self.lookup_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_dispatch_queue_depth(&self, depth: u64) {
        self.dispatch_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn reports_total(&self) -> u64 {
        self.reports_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reports_rejected(&self) -> u64 {
        self.reports_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn zone_entries(&self) -> u64 {
        self.zone_entries.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn zone_exits(&self) -> u64 {
        self.zone_exits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn charges_pending(&self) -> u64 {
        self.charges_pending.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn segments_filtered(&self) -> u64 {
        self.segments_filtered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn settlement_failures(&self) -> u64 {
        self.settlement_failures.load(Ordering::Relaxed)
    }

    /// Snapshot all counters, resetting the periodic latency window
    pub fn report(&self, active_journeys: usize, pending_charges: usize) -> MetricsSummary {
        let window = self.latency.take();
        let elapsed = std::mem::replace(&mut *self.last_report_time.lock(), Instant::now()).elapsed();
        let secs = elapsed.as_secs_f64();
        let reports_per_sec = if secs > 0.0 { window.count as f64 / secs } else { 0.0 };

        MetricsSummary {
            reports_total: self.reports_total.load(Ordering::Relaxed),
            reports_per_sec,
            avg_observe_latency_us: window.avg_us(),
            max_observe_latency_us: window.max_us,
            lat_p50_us: window.quantile_bound(0.50),
            lat_p95_us: window.quantile_bound(0.95),
            lat_p99_us: window.quantile_bound(0.99),
            lat_buckets: window.buckets,
            active_journeys,
            pending_charges,
            reports_rejected: self.reports_rejected.load(Ordering::Relaxed),
            zone_entries: self.zone_entries.load(Ordering::Relaxed),
            zone_exits: self.zone_exits.load(Ordering::Relaxed),
            zone_changes: self.zone_changes.load(Ordering::Relaxed),
            charges_completed: self.charges_completed.load(Ordering::Relaxed),
            charges_pending: self.charges_pending.load(Ordering::Relaxed),
            charges_cancelled: self.charges_cancelled.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            reconciled_charges: self.reconciled_charges.load(Ordering::Relaxed),
            reconciled_amount_minor: self.reconciled_amount.load(Ordering::Relaxed),
            stale_journeys_cancelled: self.stale_journeys_cancelled.load(Ordering::Relaxed),
            journeys_cancelled: self.journeys_cancelled.load(Ordering::Relaxed),
            segments_filtered: self.segments_filtered.load(Ordering::Relaxed),
            settlement_failures: self.settlement_failures.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            dispatch_queue_depth: self.dispatch_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub reports_total: u64,
    pub reports_per_sec: f64,
    pub avg_observe_latency_us: u64,
    pub max_observe_latency_us: u64,
    /// Observe latency histogram, same bounds as `METRICS_BUCKET_BOUNDS` plus overflow
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub active_journeys: usize,
    pub pending_charges: usize,
    pub reports_rejected: u64,
    pub zone_entries: u64,
    pub zone_exits: u64,
    pub zone_changes: u64,
    pub charges_completed: u64,
    pub charges_pending: u64,
    pub charges_cancelled: u64,
    pub reconciliations: u64,
    pub reconciled_charges: u64,
    pub reconciled_amount_minor: u64,
    pub stale_journeys_cancelled: u64,
    pub journeys_cancelled: u64,
    pub segments_filtered: u64,
    pub settlement_failures: u64,
    pub lock_conflicts: u64,
    pub lookup_failures: u64,
    pub egress_dropped: u64,
    pub dispatch_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            reports_total = %self.reports_total,
            reports_per_sec = format!("{:.1}", self.reports_per_sec),
            avg_latency_us = %self.avg_observe_latency_us,
            p99_us = %self.lat_p99_us,
            active_journeys = %self.active_journeys,
            pending_charges = %self.pending_charges,
            entries = %self.zone_entries,
            exits = %self.zone_exits,
            charges_completed = %self.charges_completed,
            charges_pending = %self.charges_pending,
            rejected = %self.reports_rejected,
            settlement_failures = %self.settlement_failures,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.reports_total(), 0);
        assert_eq!(metrics.zone_entries(), 0);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_report_processed(100);
        metrics.record_report_processed(200);
        metrics.record_report_processed(300);
        metrics.record_entry();
        metrics.record_charge(false);

        let summary = metrics.report(4, 1);

        assert_eq!(summary.reports_total, 3);
        assert_eq!(summary.avg_observe_latency_us, 200);
        assert_eq!(summary.max_observe_latency_us, 300);
        assert_eq!(summary.active_journeys, 4);
        assert_eq!(summary.pending_charges, 1);
        assert_eq!(summary.zone_entries, 1);
        assert_eq!(summary.charges_pending, 1);
        assert_eq!(summary.charges_completed, 0);

        // periodic window resets, monotonic counters do not
        assert_eq!(metrics.latency.count.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency.max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.report(0, 0).reports_total, 3);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report(0, 0);
        assert_eq!(summary.reports_total, 0);
        assert_eq!(summary.avg_observe_latency_us, 0);
        assert_eq!(summary.lat_p99_us, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        m.record_report_processed(i as u64);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.reports_total(), 10_000);
    }

    #[test]
    fn test_latency_bucket_edges() {
        let window = LatencyWindow::new();
        for us in [0, 50, 51, 25_600, 25_601] {
            window.record(us);
        }
        let snap = window.take();
        assert_eq!(snap.buckets[0], 2);
        assert_eq!(snap.buckets[1], 1);
        assert_eq!(snap.buckets[9], 1);
        assert_eq!(snap.buckets[10], 1);
        assert_eq!(snap.max_us, 25_601);
        assert_eq!(snap.quantile_bound(1.0), OVERFLOW_BOUND);
        assert_eq!(window.take().count, 0);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_report_processed(150);
        }
        let summary = metrics.report(0, 0);
        assert_eq!(summary.lat_p50_us, 200);
        assert_eq!(summary.lat_p99_us, 200);
    }

    #[test]
    fn test_reconciliation_counters() {
        let metrics = Metrics::new();
        metrics.record_reconciliation(2, 4000);
        metrics.record_reconciliation(0, 0);
        metrics.record_journey_cancelled(true);
        metrics.record_journey_cancelled(false);

        let summary = metrics.report(0, 0);
        assert_eq!(summary.reconciliations, 2);
        assert_eq!(summary.reconciled_charges, 2);
        assert_eq!(summary.reconciled_amount_minor, 4000);
        assert_eq!(summary.journeys_cancelled, 2);
        assert_eq!(summary.stale_journeys_cancelled, 1);
    }
}
