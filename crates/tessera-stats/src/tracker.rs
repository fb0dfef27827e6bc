//! Typed metric registry
//!
//! Naming convention, enforced by use:
//!
//! - `*.n` - counter
//! - `*.ns` - latency (nanoseconds, averaged per period)
//! - `*.ns.total` - cumulative latency
//! - `*.size` - size (bytes)
//! - `*.bps` - throughput, derived from the paired `*.size` per period
//!
//! The hot path is atomic adds against pre-registered cells; there are no
//! locks to take per I/O. A snapshot is a best-effort pointwise read, not
//! a consistent cut.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;

use tessera_common::{Error, Result};

// counters and sizes
pub const GET_COUNT: &str = "get.n";
pub const PUT_COUNT: &str = "put.n";
pub const DELETE_COUNT: &str = "del.n";
pub const GET_SIZE: &str = "get.size";
pub const PUT_SIZE: &str = "put.size";

pub const LRU_EVICT_COUNT: &str = "lru.evict.n";
pub const LRU_EVICT_SIZE: &str = "lru.evict.size";
pub const CLEANUP_STORE_COUNT: &str = "cleanup.store.n";
pub const CLEANUP_STORE_SIZE: &str = "cleanup.store.size";

pub const VER_CHANGE_COUNT: &str = "ver.change.n";
pub const VER_CHANGE_SIZE: &str = "ver.change.size";

// errors; checksum and I/O failures feed the soft-error monitor
pub const ERR_CKSUM_COUNT: &str = "err.cksum.n";
pub const ERR_CKSUM_SIZE: &str = "err.cksum.size";
pub const ERR_IO_COUNT: &str = "err.io.n";

// latencies
pub const GET_LATENCY: &str = "get.ns";
pub const PUT_LATENCY: &str = "put.ns";
pub const PUT_LATENCY_TOTAL: &str = "put.ns.total";

// throughput
pub const GET_THROUGHPUT: &str = "get.bps";
pub const PUT_THROUGHPUT: &str = "put.bps";

// lom cache
pub const LCACHE_EVICTED_COUNT: &str = "lcache.evicted.n";
pub const LCACHE_FLUSH_COLD_COUNT: &str = "lcache.flush.cold.n";

/// `disk.<disk>.<suffix>` names for per-disk metrics
#[must_use]
pub fn disk_metric_name(disk: &str, suffix: &str) -> String {
    format!("disk.{disk}.{suffix}")
}

/// What a metric measures and how it rolls up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Monotone event count
    Counter,
    /// Monotone byte count
    Size,
    /// Sum + samples, rolled to mean-ns each period
    Latency,
    /// Monotone latency sum
    TotalLatency,
    /// bytes/sec derived from the paired `.size` metric each period
    Throughput,
    /// bytes/sec computed externally (disk read/write rates)
    ComputedThroughput,
    /// Point-in-time value
    Gauge,
}

#[derive(Debug)]
struct Metric {
    kind: Kind,
    /// Hot accumulator (latency sum per period) or current value (gauges)
    value: AtomicI64,
    /// Latency samples this period
    num_samples: AtomicI64,
    /// Monotone total across periods
    cumulative: AtomicI64,
    /// Roll-up bookkeeping: last seen total (change detection), or the
    /// paired-size total a throughput was last derived from
    prev: AtomicI64,
}

impl Metric {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            value: AtomicI64::new(0),
            num_samples: AtomicI64::new(0),
            cumulative: AtomicI64::new(0),
            prev: AtomicI64::new(0),
        }
    }
}

/// Concurrent metric registry
#[derive(Debug, Default)]
pub struct Tracker {
    metrics: DashMap<String, Arc<Metric>>,
}

impl Tracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric. Re-registering the same name with the same kind
    /// is idempotent; with a different kind it is a config error.
    pub fn register(&self, name: &str, kind: Kind) -> Result<()> {
        if let Some(existing) = self.metrics.get(name) {
            if existing.kind == kind {
                return Ok(());
            }
            return Err(Error::config(format!(
                "metric {name} already registered with kind {:?}",
                existing.kind
            )));
        }
        self.metrics.insert(name.to_owned(), Arc::new(Metric::new(kind)));
        Ok(())
    }

    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    /// Accumulate a delta; atomic, lock-free
    pub fn add(&self, name: &str, delta: i64) {
        let Some(metric) = self.metrics.get(name) else {
            debug_assert!(false, "unregistered metric {name}");
            warn!("add to unregistered metric {name}");
            return;
        };
        match metric.kind {
            Kind::Counter | Kind::Size | Kind::TotalLatency => {
                metric.cumulative.fetch_add(delta, Ordering::Relaxed);
            }
            Kind::Latency => {
                metric.value.fetch_add(delta, Ordering::Relaxed);
                metric.num_samples.fetch_add(1, Ordering::Relaxed);
                metric.cumulative.fetch_add(delta, Ordering::Relaxed);
            }
            // externally computed values do not accumulate
            Kind::Throughput | Kind::ComputedThroughput | Kind::Gauge => {
                metric.value.store(delta, Ordering::Relaxed);
            }
        }
    }

    /// Batch of deltas
    pub fn add_many(&self, deltas: &[(&str, i64)]) {
        for (name, delta) in deltas {
            self.add(name, *delta);
        }
    }

    /// Overwrite a gauge/computed-throughput value
    pub fn set(&self, name: &str, value: i64) {
        let Some(metric) = self.metrics.get(name) else {
            debug_assert!(false, "unregistered metric {name}");
            warn!("set of unregistered metric {name}");
            return;
        };
        debug_assert!(matches!(
            metric.kind,
            Kind::Gauge | Kind::ComputedThroughput
        ));
        metric.value.store(value, Ordering::Relaxed);
    }

    /// Current value: monotone totals for accumulating kinds, the point
    /// value for gauges
    #[must_use]
    pub fn get(&self, name: &str) -> i64 {
        self.metrics.get(name).map_or(0, |m| match m.kind {
            Kind::Counter | Kind::Size | Kind::Latency | Kind::TotalLatency => {
                m.cumulative.load(Ordering::Relaxed)
            }
            _ => m.value.load(Ordering::Relaxed),
        })
    }

    /// Clone all current values for export; pointwise, not a consistent
    /// cut
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.metrics
            .iter()
            .map(|e| {
                let m = e.value();
                let v = match m.kind {
                    Kind::Counter | Kind::Size | Kind::Latency | Kind::TotalLatency => {
                        m.cumulative.load(Ordering::Relaxed)
                    }
                    _ => m.value.load(Ordering::Relaxed),
                };
                (e.key().clone(), v)
            })
            .collect()
    }

    /// Periodic roll-up: average latencies and reset their accumulators,
    /// derive throughputs from their paired size totals, detect change.
    ///
    /// Returns the per-period view and whether the period was idle (no
    /// accumulating metric moved).
    pub fn rollup(&self, period: Duration) -> (BTreeMap<String, i64>, bool) {
        let period_ms = period.as_millis().max(1) as i64;
        let mut out = BTreeMap::new();
        let mut idle = true;

        // two passes: deriving a throughput reads its paired size metric,
        // which must not happen while iterating the map
        let mut throughputs = Vec::new();
        for e in self.metrics.iter() {
            let (name, m) = (e.key(), e.value());
            let v = match m.kind {
                Kind::Latency => {
                    let sum = m.value.swap(0, Ordering::Relaxed);
                    let n = m.num_samples.swap(0, Ordering::Relaxed);
                    if n > 0 {
                        idle = false;
                    }
                    if n > 0 {
                        sum / n
                    } else {
                        0
                    }
                }
                Kind::Counter | Kind::Size | Kind::TotalLatency => {
                    let cum = m.cumulative.load(Ordering::Relaxed);
                    if m.prev.swap(cum, Ordering::Relaxed) != cum {
                        idle = false;
                    }
                    cum
                }
                Kind::Throughput => {
                    throughputs.push(name.clone());
                    continue;
                }
                Kind::ComputedThroughput | Kind::Gauge => m.value.load(Ordering::Relaxed),
            };
            out.insert(name.clone(), v);
        }

        for name in throughputs {
            let total = self
                .metrics
                .get(&paired_size_name(&name))
                .map_or(0, |size| size.cumulative.load(Ordering::Relaxed));
            let Some(m) = self.metrics.get(&name) else {
                continue;
            };
            let delta = total - m.prev.swap(total, Ordering::Relaxed);
            drop(m);
            out.insert(name, delta * 1000 / period_ms);
        }
        (out, idle)
    }

    /// The kind a metric was registered with
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<Kind> {
        self.metrics.get(name).map(|m| m.kind)
    }
}

/// `x.bps` draws from `x.size`
fn paired_size_name(throughput: &str) -> String {
    let base = throughput.strip_suffix(".bps").unwrap_or(throughput);
    format!("{base}.size")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_register_idempotent_and_conflicting() {
        let tracker = Tracker::new();
        tracker.register(PUT_COUNT, Kind::Counter).unwrap();
        tracker.register(PUT_COUNT, Kind::Counter).unwrap();
        assert!(tracker.register(PUT_COUNT, Kind::Gauge).is_err());
    }

    #[test]
    fn test_concurrent_adds_sum_up() {
        let tracker = Arc::new(Tracker::new());
        tracker.register(GET_COUNT, Kind::Counter).unwrap();
        tracker.register(GET_SIZE, Kind::Size).unwrap();

        thread::scope(|s| {
            for _ in 0..8 {
                let tracker = Arc::clone(&tracker);
                s.spawn(move || {
                    for _ in 0..1000 {
                        tracker.inc(GET_COUNT);
                        tracker.add(GET_SIZE, 4096);
                    }
                });
            }
        });
        assert_eq!(tracker.get(GET_COUNT), 8000);
        assert_eq!(tracker.get(GET_SIZE), 8000 * 4096);
    }

    #[test]
    fn test_counters_are_monotone_across_rollups() {
        let tracker = Tracker::new();
        tracker.register(PUT_COUNT, Kind::Counter).unwrap();
        let mut last = 0;
        for i in 1..=10 {
            tracker.inc(PUT_COUNT);
            let (out, _) = tracker.rollup(Duration::from_secs(1));
            assert!(out[PUT_COUNT] >= last);
            last = out[PUT_COUNT];
            assert_eq!(last, i);
        }
    }

    #[test]
    fn test_latency_mean_and_reset() {
        let tracker = Tracker::new();
        tracker.register(PUT_LATENCY, Kind::Latency).unwrap();
        for _ in 0..10 {
            tracker.add(PUT_LATENCY, 2_000_000); // 2ms each
        }
        let (out, idle) = tracker.rollup(Duration::from_secs(1));
        assert_eq!(out[PUT_LATENCY], 2_000_000);
        assert!(!idle);

        // accumulator was reset; an empty period averages to zero
        let (out, idle) = tracker.rollup(Duration::from_secs(1));
        assert_eq!(out[PUT_LATENCY], 0);
        assert!(idle);

        // the cumulative total is untouched by resets
        assert_eq!(tracker.get(PUT_LATENCY), 20_000_000);
    }

    #[test]
    fn test_throughput_from_paired_size() {
        // 10 puts of 1 MiB over one second -> 10 MiB/s
        let tracker = Tracker::new();
        tracker.register(PUT_SIZE, Kind::Size).unwrap();
        tracker.register(PUT_THROUGHPUT, Kind::Throughput).unwrap();

        for _ in 0..10 {
            tracker.add(PUT_SIZE, 1024 * 1024);
        }
        let (out, _) = tracker.rollup(Duration::from_secs(1));
        assert_eq!(out[PUT_THROUGHPUT], 10 * 1024 * 1024);
        assert_eq!(out[PUT_SIZE], 10 * 1024 * 1024);

        // idle period: no new bytes, bps drops to zero
        let (out, idle) = tracker.rollup(Duration::from_secs(1));
        assert_eq!(out[PUT_THROUGHPUT], 0);
        assert!(idle);
    }

    #[test]
    fn test_gauge_set() {
        let tracker = Tracker::new();
        let name = disk_metric_name("sda", "util");
        tracker.register(&name, Kind::Gauge).unwrap();
        tracker.set(&name, 82);
        assert_eq!(tracker.get(&name), 82);
        let (out, idle) = tracker.rollup(Duration::from_secs(1));
        assert_eq!(out[&name], 82);
        // gauges alone do not break idleness
        assert!(idle);
    }

    #[test]
    fn test_add_many() {
        let tracker = Tracker::new();
        tracker.register(LRU_EVICT_COUNT, Kind::Counter).unwrap();
        tracker.register(LRU_EVICT_SIZE, Kind::Size).unwrap();
        tracker.add_many(&[(LRU_EVICT_COUNT, 3), (LRU_EVICT_SIZE, 3 * 4096)]);
        assert_eq!(tracker.get(LRU_EVICT_COUNT), 3);
        assert_eq!(tracker.get(LRU_EVICT_SIZE), 3 * 4096);
    }

    #[test]
    fn test_snapshot_is_pointwise() {
        let tracker = Tracker::new();
        tracker.register(GET_COUNT, Kind::Counter).unwrap();
        tracker.register(GET_LATENCY, Kind::Latency).unwrap();
        tracker.inc(GET_COUNT);
        tracker.add(GET_LATENCY, 500);

        let snap = tracker.snapshot();
        assert_eq!(snap["get.n"], 1);
        assert_eq!(snap["get.ns"], 500);
    }

    #[test]
    fn test_paired_size_name() {
        assert_eq!(paired_size_name("put.bps"), "put.size");
        assert_eq!(paired_size_name("get.bps"), "get.size");
    }
}
