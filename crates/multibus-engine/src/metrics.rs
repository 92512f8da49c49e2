//! Per-bus counters/latency and the process-wide [`Monitor`] (spec §4.5).

use dashmap::DashMap;
use multibus_core::Priority;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const BUS_LATENCY_RING: usize = 100;
const MONITOR_LATENCY_RING: usize = 512;
/// EMA smoothing factor applied to average latency (spec §4.5: "1/5").
const EMA_ALPHA: f64 = 1.0 / 5.0;

#[derive(Debug, Clone, Default)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub failed: u64,
    pub current_latency_ms: u64,
    pub average_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// Atomic counters for a single bus.
pub struct BusMetrics {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    current_latency_ms: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_count: AtomicU64,
    recent_latencies: Mutex<VecDeque<u64>>,
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self {
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            current_latency_ms: AtomicU64::new(0),
            min_latency_ms: AtomicU64::new(u64::MAX),
            max_latency_ms: AtomicU64::new(0),
            latency_total_ms: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            recent_latencies: Mutex::new(VecDeque::with_capacity(BUS_LATENCY_RING)),
        }
    }
}

impl BusMetrics {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, latency_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.current_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.latency_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        let mut ring = self.recent_latencies.lock();
        if ring.len() == BUS_LATENCY_RING {
            ring.pop_front();
        }
        ring.push_back(latency_ms);
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let total = self.latency_total_ms.load(Ordering::Relaxed);
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        BusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            current_latency_ms: self.current_latency_ms.load(Ordering::Relaxed),
            average_latency_ms: if count == 0 { 0.0 } else { total as f64 / count as f64 },
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorSnapshot {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub failed: u64,
    pub dropped_by_reason: Vec<(String, u64)>,
    pub published_by_priority: Vec<(Priority, u64)>,
    pub average_latency_ms: f64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub queue_size: usize,
    pub healthy: bool,
    pub last_error: Option<String>,
}

/// Process-wide observability: augments per-bus [`BusMetrics`] with
/// bucketed drop reasons, published-by-priority, and percentile latency
/// (spec §4.5).
pub struct Monitor {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    dropped_by_reason: DashMap<String, u64>,
    published_by_priority: DashMap<Priority, u64>,
    ema_avg_latency_micros: AtomicI64,
    latency_samples: RwLock<VecDeque<u64>>,
    queue_size: AtomicUsize,
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped_by_reason: DashMap::new(),
            published_by_priority: DashMap::new(),
            ema_avg_latency_micros: AtomicI64::new(0),
            latency_samples: RwLock::new(VecDeque::with_capacity(MONITOR_LATENCY_RING)),
            queue_size: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }
}

impl Monitor {
    pub fn record_published(&self, priority: Priority) {
        self.published.fetch_add(1, Ordering::Relaxed);
        *self.published_by_priority.entry(priority).or_insert(0) += 1;
    }

    pub fn record_processed(&self, latency_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.record_latency_sample(latency_ms);
        self.update_ema(latency_ms);
    }

    pub fn record_dropped(&self, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        *self.dropped_by_reason.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_failed(&self, error: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.into());
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn record_latency_sample(&self, latency_ms: u64) {
        let mut samples = self.latency_samples.write();
        if samples.len() == MONITOR_LATENCY_RING {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    /// `avg' = avg + alpha * (sample - avg)`, damping spikes (spec §4.5).
    fn update_ema(&self, latency_ms: u64) {
        loop {
            let prev_micros = self.ema_avg_latency_micros.load(Ordering::Relaxed);
            let prev = prev_micros as f64 / 1000.0;
            let next = prev + EMA_ALPHA * (latency_ms as f64 - prev);
            let next_micros = (next * 1000.0).round() as i64;
            if self
                .ema_avg_latency_micros
                .compare_exchange(prev_micros, next_micros, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn average_latency_ms(&self) -> f64 {
        self.ema_avg_latency_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Sampled p95/p99 via quickselect over a snapshot of the ring, taken
    /// under the read lock (spec §4.5).
    pub fn percentiles(&self) -> (u64, u64) {
        let snapshot: Vec<u64> = self.latency_samples.read().iter().copied().collect();
        if snapshot.is_empty() {
            return (0, 0);
        }
        let p95 = quickselect_percentile(snapshot.clone(), 0.95);
        let p99 = quickselect_percentile(snapshot, 0.99);
        (p95, p99)
    }

    /// Clears all counters and samples. The monitor is a process-wide
    /// singleton (spec §9: "module-level singletons... tests must use
    /// Reset... to avoid cross-test leakage"); tests that assert on
    /// exact bucket counts call this first.
    pub fn reset(&self) {
        self.published.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.dropped_by_reason.clear();
        self.published_by_priority.clear();
        self.ema_avg_latency_micros.store(0, Ordering::Relaxed);
        self.latency_samples.write().clear();
        self.queue_size.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
        *self.last_error.lock() = None;
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let (p95, p99) = self.percentiles();
        MonitorSnapshot {
            published: self.published.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_by_reason: self
                .dropped_by_reason
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            published_by_priority: self
                .published_by_priority
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            average_latency_ms: self.average_latency_ms(),
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            queue_size: self.queue_size.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Selects the element at the given percentile (0.0..=1.0) by partitioning
/// rather than a full sort — O(n) average case.
fn quickselect_percentile(mut values: Vec<u64>, percentile: f64) -> u64 {
    let len = values.len();
    if len == 0 {
        return 0;
    }
    let k = ((len - 1) as f64 * percentile).round() as usize;
    let k = k.min(len - 1);
    *values.select_nth_unstable(k).1
}

pub static GLOBAL_MONITOR: once_cell::sync::Lazy<Arc<Monitor>> =
    once_cell::sync::Lazy::new(|| Arc::new(Monitor::default()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_metrics_track_counts_and_latency() {
        let m = BusMetrics::default();
        m.record_published();
        m.record_published();
        m.record_processed(10);
        m.record_processed(20);
        m.record_dropped();
        m.record_failed();

        let snap = m.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.average_latency_ms, 15.0);
        assert_eq!(snap.min_latency_ms, 10);
        assert_eq!(snap.max_latency_ms, 20);
    }

    #[test]
    fn monitor_buckets_drops_by_reason() {
        let mon = Monitor::default();
        mon.record_dropped("throttled");
        mon.record_dropped("throttled");
        mon.record_dropped("drop_newest");

        let snap = mon.snapshot();
        let throttled = snap
            .dropped_by_reason
            .iter()
            .find(|(r, _)| r == "throttled")
            .map(|(_, c)| *c);
        assert_eq!(throttled, Some(2));
        assert_eq!(snap.dropped, 3);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mon = Monitor::default();
        for i in 1..=100u64 {
            mon.record_processed(i);
        }
        let (p95, p99) = mon.percentiles();
        assert!(p95 <= p99);
        assert!(p95 >= 90 && p95 <= 100);
    }

    #[test]
    fn ema_damps_toward_samples() {
        let mon = Monitor::default();
        mon.record_processed(100);
        let after_one = mon.average_latency_ms();
        assert!((after_one - 20.0).abs() < 0.01);
        for _ in 0..50 {
            mon.record_processed(100);
        }
        assert!((mon.average_latency_ms() - 100.0).abs() < 1.0);
    }
}
