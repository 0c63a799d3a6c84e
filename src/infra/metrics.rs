//! Lock-free swipe and delivery counters
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are
//! statistical counters only; nothing reads them to make decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters shared between the session loop, the delivery drain tasks and
/// the periodic reporter
pub struct Metrics {
    /// Session iterations started (monotonic)
    cycles_total: AtomicU64,
    /// Iterations that found no reader attached (monotonic)
    idle_cycles_total: AtomicU64,
    /// Badges captured and handed to the publisher (monotonic)
    swipes_total: AtomicU64,
    /// Delivery reports confirming success (monotonic)
    deliveries_confirmed: AtomicU64,
    /// Delivery reports carrying an error (monotonic)
    deliveries_failed: AtomicU64,
    /// Messages still outstanding when the flush timed out (monotonic)
    deliveries_unconfirmed: AtomicU64,
    /// Swipes since last report (reset on report)
    swipes_since_report: AtomicU64,
    /// Sum of publish durations in microseconds (reset on report)
    publish_latency_sum_us: AtomicU64,
    /// Max publish duration in microseconds (reset on report)
    publish_latency_max_us: AtomicU64,
    last_report: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            idle_cycles_total: AtomicU64::new(0),
            swipes_total: AtomicU64::new(0),
            deliveries_confirmed: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            deliveries_unconfirmed: AtomicU64::new(0),
            swipes_since_report: AtomicU64::new(0),
            publish_latency_sum_us: AtomicU64::new(0),
            publish_latency_max_us: AtomicU64::new(0),
            last_report: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_cycle(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_idle_cycle(&self) {
        self.idle_cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_swipe(&self) {
        self.swipes_total.fetch_add(1, Ordering::Relaxed);
        self.swipes_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_confirmed(&self) {
        self.deliveries_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivery_failed(&self, count: u64) {
        self.deliveries_failed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unconfirmed(&self, count: u64) {
        self.deliveries_unconfirmed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_latency(&self, latency_us: u64) {
        self.publish_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.publish_latency_max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn swipes_total(&self) -> u64 {
        self.swipes_total.load(Ordering::Relaxed)
    }

    pub fn deliveries_confirmed(&self) -> u64 {
        self.deliveries_confirmed.load(Ordering::Relaxed)
    }

    pub fn deliveries_failed(&self) -> u64 {
        self.deliveries_failed.load(Ordering::Relaxed)
    }

    /// Snapshot counters; per-interval values are reset
    pub fn report(&self) -> MetricsSummary {
        let elapsed = {
            let mut last = self.last_report.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let swipes_interval = self.swipes_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.publish_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.publish_latency_max_us.swap(0, Ordering::Relaxed);

        MetricsSummary {
            interval_secs: elapsed.as_secs_f64(),
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            idle_cycles_total: self.idle_cycles_total.load(Ordering::Relaxed),
            swipes_total: self.swipes_total.load(Ordering::Relaxed),
            swipes_interval,
            deliveries_confirmed: self.deliveries_confirmed.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            deliveries_unconfirmed: self.deliveries_unconfirmed.load(Ordering::Relaxed),
            avg_publish_latency_us: if swipes_interval > 0 { latency_sum / swipes_interval } else { 0 },
            max_publish_latency_us: latency_max,
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub interval_secs: f64,
    pub cycles_total: u64,
    pub idle_cycles_total: u64,
    pub swipes_total: u64,
    pub swipes_interval: u64,
    pub deliveries_confirmed: u64,
    pub deliveries_failed: u64,
    pub deliveries_unconfirmed: u64,
    pub avg_publish_latency_us: u64,
    pub max_publish_latency_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            interval_secs = %format!("{:.1}", self.interval_secs),
            cycles = %self.cycles_total,
            idle_cycles = %self.idle_cycles_total,
            swipes = %self.swipes_total,
            swipes_interval = %self.swipes_interval,
            delivered = %self.deliveries_confirmed,
            failed = %self.deliveries_failed,
            unconfirmed = %self.deliveries_unconfirmed,
            avg_publish_us = %self.avg_publish_latency_us,
            max_publish_us = %self.max_publish_latency_us,
            "metrics"
        );
    }
}
