//! Periodic stats runner
//!
//! One long-lived ticker (default 10 s). Each tick: soft-error monitor,
//! disk-stats refresh into the per-disk metrics and the mountpath
//! utilization cells, metric roll-up with a coalesced log line (suppressed
//! when idle and unchanged, forced at least once per
//! `max_stats_log_interval`), capacity refresh with space-manager
//! triggering and node-state flag maintenance, and StatsD export.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tessera_common::{Config, NodeStateFlags, NODE_LOW_CAPACITY, NODE_OOS};
use tessera_core::Tctx;
use tessera_fs::{cap_refresh, CapStatus, DiskPoller, TargetCdf};

use crate::export::{Node, NodeV1, Snode};
use crate::statsd::{MetricClass, Statsd};
use crate::tracker::{disk_metric_name, Kind, Tracker};
use crate::tracker::{
    CLEANUP_STORE_COUNT, CLEANUP_STORE_SIZE, DELETE_COUNT, ERR_CKSUM_COUNT, ERR_CKSUM_SIZE,
    ERR_IO_COUNT, GET_COUNT, GET_LATENCY, GET_SIZE, GET_THROUGHPUT, LCACHE_EVICTED_COUNT,
    LCACHE_FLUSH_COLD_COUNT, LRU_EVICT_COUNT, LRU_EVICT_SIZE, PUT_COUNT, PUT_LATENCY,
    PUT_LATENCY_TOTAL, PUT_SIZE, PUT_THROUGHPUT, VER_CHANGE_COUNT, VER_CHANGE_SIZE,
};

/// Disks quieter than this stay out of the log
const MIN_LOG_DISK_UTIL: i64 = 10;

/// The target stats runner
pub struct Trunner {
    ctx: Arc<Tctx>,
    tracker: Arc<Tracker>,
    snode: Snode,
    poller: DiskPoller,
    tcdf: RwLock<TargetCdf>,
    flags: Arc<NodeStateFlags>,
    statsd: Option<Statsd>,
    // ticker-serial state
    prev_line: String,
    next_log: Instant,
    soft_errs: i64,
    last_max_util: i64,
    fs_ids: Vec<u64>,
}

impl Trunner {
    pub fn new(ctx: Arc<Tctx>, node_id: Option<String>) -> Self {
        let tracker = Arc::new(Tracker::new());
        reg_target_metrics(&tracker);

        let statsd = ctx.config.statsd.as_ref().and_then(|conf| {
            Statsd::new(conf)
                .map_err(|e| warn!("statsd disabled: {e}"))
                .ok()
        });

        Self {
            ctx,
            tracker,
            snode: Snode::target(node_id),
            poller: DiskPoller::new(),
            tcdf: RwLock::new(TargetCdf::default()),
            flags: Arc::new(NodeStateFlags::default()),
            statsd,
            prev_line: String::new(),
            next_log: Instant::now(),
            soft_errs: 0,
            last_max_util: 0,
            fs_ids: Vec::new(),
        }
    }

    /// The shared registry; clone freely onto I/O paths
    #[must_use]
    pub fn tracker(&self) -> Arc<Tracker> {
        Arc::clone(&self.tracker)
    }

    /// OOS / low-capacity flags, maintained by the ticker
    #[must_use]
    pub fn node_state(&self) -> Arc<NodeStateFlags> {
        Arc::clone(&self.flags)
    }

    /// Run until the stop channel fires
    pub async fn run(mut self, mut stop_rx: mpsc::Receiver<()>) {
        let period = self.ctx.config.periodic.stats_time();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = stop_rx.recv() => {
                    info!("stats runner: stopping");
                    return;
                }
            }
        }
    }

    /// One full period; also driven directly by tests
    pub fn tick(&mut self) {
        let config = Arc::clone(&self.ctx.config);
        let now = Instant::now();

        self.check_soft_errs(&config);
        self.update_disk_metrics(&config);

        let (rolled, mut idle) = self.tracker.rollup(config.periodic.stats_time());
        if self.last_max_util >= config.disk.disk_util_low_wm {
            idle = false;
        }

        let force = now >= self.next_log;
        if force || !idle {
            let line = log_line(&rolled);
            if !line.is_empty() && line != self.prev_line {
                info!("{line}");
                self.prev_line = line;
            }
        }

        self.check_capacity(&config, now, force);

        if let Some(statsd) = &self.statsd {
            for (name, value) in &rolled {
                if let Some(kind) = self.tracker.kind(name) {
                    statsd.send(name, *value, MetricClass::from_kind(kind));
                }
            }
        }

        if force {
            self.next_log = now + config.periodic.max_stats_log_interval();
        }
    }

    fn update_disk_metrics(&mut self, config: &Config) {
        let stats = self.poller.stats(config.disk.iostat_time());
        let mut max_util = 0;
        for (disk, stat) in &stats {
            self.reg_disk_metrics(disk);
            self.tracker
                .set(&disk_metric_name(disk, "read.bps"), stat.rbps);
            self.tracker
                .set(&disk_metric_name(disk, "write.bps"), stat.wbps);
            self.tracker
                .set(&disk_metric_name(disk, "avg.rsize"), stat.ravg);
            self.tracker
                .set(&disk_metric_name(disk, "avg.wsize"), stat.wavg);
            self.tracker.set(&disk_metric_name(disk, "util"), stat.util);
            max_util = max_util.max(stat.util);
            if stat.util >= MIN_LOG_DISK_UTIL {
                info!(
                    "{disk}: {}/s, {}, {}/s, {}, {}%",
                    stat.rbps, stat.ravg, stat.wbps, stat.wavg, stat.util
                );
            }
        }
        self.last_max_util = max_util;

        // feed the lock-free utilization cells read by GET load balancing
        for mpath in self.ctx.mountpaths.iter() {
            let util = mpath
                .disks
                .iter()
                .filter_map(|d| stats.get(d))
                .map(|s| s.util)
                .max();
            if let Some(util) = util {
                mpath.set_util(util);
            }
        }
    }

    fn reg_disk_metrics(&self, disk: &str) {
        let rbps = disk_metric_name(disk, "read.bps");
        if self.tracker.is_registered(&rbps) {
            return;
        }
        let _ = self.tracker.register(&rbps, Kind::ComputedThroughput);
        let _ = self
            .tracker
            .register(&disk_metric_name(disk, "write.bps"), Kind::ComputedThroughput);
        let _ = self
            .tracker
            .register(&disk_metric_name(disk, "avg.rsize"), Kind::Gauge);
        let _ = self
            .tracker
            .register(&disk_metric_name(disk, "avg.wsize"), Kind::Gauge);
        let _ = self
            .tracker
            .register(&disk_metric_name(disk, "util"), Kind::Gauge);
    }

    fn check_capacity(&mut self, config: &Config, now: Instant, force: bool) {
        let cs = {
            let mut tcdf = self.tcdf.write();
            match cap_refresh(config, &self.ctx.mountpaths, &mut tcdf) {
                Ok(cs) => cs,
                Err(e) => {
                    error!("capacity refresh failed: {e}");
                    return;
                }
            }
        };
        self.on_capacity(config, cs, now, force);
    }

    /// Watermark checks and node-state flags for one capacity reading;
    /// factored out of the ticker so embedding targets can apply readings
    /// of their own
    pub fn on_capacity(&mut self, config: &Config, cs: CapStatus, _now: Instant, force: bool) {
        let err = cs.err(config);

        // cross the cleanup watermark: hand the rest to the space manager
        // (single-flight there absorbs re-triggers)
        if cs.oos || i64::from(cs.pct_max) > config.space.cleanup_wm {
            self.ctx.hooks().oos(&cs);
        }

        let has_alerts = self.tcdf.read().has_alerts();
        if force || err.is_some() || has_alerts {
            self.fs_ids.clear();
            let tcdf = self.tcdf.read();
            for (mpath, cdf) in &tcdf.mountpaths {
                // one line per filesystem, not per mountpath
                if self.fs_ids.contains(&cdf.fs_id) {
                    continue;
                }
                self.fs_ids.push(cdf.fs_id);
                match &cdf.alert {
                    Some(alert) => warn!("{mpath}: {alert}"),
                    None => info!(
                        "{mpath}: used {}%, avail {}",
                        cdf.capacity.pct_used, cdf.capacity.avail
                    ),
                }
            }
        }

        if cs.oos {
            self.flags.set(NODE_OOS);
        } else if err.is_some() {
            self.flags.clear(NODE_OOS);
            self.flags.set(NODE_LOW_CAPACITY);
        } else {
            self.flags.clear(NODE_OOS | NODE_LOW_CAPACITY);
        }
    }

    fn check_soft_errs(&mut self, config: &Config) {
        let c = &config.fshc;
        if !c.enabled {
            return;
        }
        let stats_time = config.periodic.stats_time();
        // cannot reliably extrapolate to the configured window below 5s
        if stats_time < Duration::from_secs(5) {
            return;
        }
        let n = self.num_soft_errs();
        let delta = n - self.soft_errs;
        self.soft_errs = n;
        if delta <= 0 {
            return;
        }
        let extrapolated =
            delta * c.soft_err_time().as_millis() as i64 / stats_time.as_millis().max(1) as i64;
        if extrapolated < c.soft_errs {
            return;
        }
        error!(
            "{delta} soft errors within {stats_time:?} exceed {} per {:?}",
            c.soft_errs,
            c.soft_err_time()
        );
        warn!("waking up FSHC to check all mountpaths");
        self.ctx.hooks().soft_fshc();
    }

    fn num_soft_errs(&self) -> i64 {
        self.tracker.get(ERR_CKSUM_COUNT) + self.tracker.get(ERR_IO_COUNT)
    }

    /// Current export snapshot, with capacity refreshed on demand
    pub fn get_stats(&self) -> Node {
        let cdf = {
            let mut tcdf = self.tcdf.write();
            if let Err(e) = cap_refresh(&self.ctx.config, &self.ctx.mountpaths, &mut tcdf) {
                error!("capacity refresh failed: {e}");
            }
            tcdf.clone()
        };
        Node {
            snode: self.snode.clone(),
            tracker: self.tracker.snapshot(),
            cdf,
        }
    }

    /// The prior major version of the export schema
    pub fn get_stats_legacy(&self) -> NodeV1 {
        NodeV1::from(&self.get_stats())
    }
}

/// Register the target metric set
fn reg_target_metrics(tracker: &Tracker) {
    let regs: &[(&str, Kind)] = &[
        (GET_COUNT, Kind::Counter),
        (PUT_COUNT, Kind::Counter),
        (DELETE_COUNT, Kind::Counter),
        (GET_SIZE, Kind::Size),
        (PUT_SIZE, Kind::Size),
        (GET_LATENCY, Kind::Latency),
        (PUT_LATENCY, Kind::Latency),
        (PUT_LATENCY_TOTAL, Kind::TotalLatency),
        (GET_THROUGHPUT, Kind::Throughput),
        (PUT_THROUGHPUT, Kind::Throughput),
        (LRU_EVICT_COUNT, Kind::Counter),
        (LRU_EVICT_SIZE, Kind::Size),
        (CLEANUP_STORE_COUNT, Kind::Counter),
        (CLEANUP_STORE_SIZE, Kind::Size),
        (VER_CHANGE_COUNT, Kind::Counter),
        (VER_CHANGE_SIZE, Kind::Size),
        (ERR_CKSUM_COUNT, Kind::Counter),
        (ERR_CKSUM_SIZE, Kind::Size),
        (ERR_IO_COUNT, Kind::Counter),
        (LCACHE_EVICTED_COUNT, Kind::Counter),
        (LCACHE_FLUSH_COLD_COUNT, Kind::Counter),
    ];
    for (name, kind) in regs {
        // the set is static; collisions would be a programming error
        tracker.register(name, *kind).expect("metric registration");
    }
}

/// One coalesced log line: the non-zero metrics as compact JSON
fn log_line(rolled: &std::collections::BTreeMap<String, i64>) -> String {
    let nonzero: std::collections::BTreeMap<&str, i64> = rolled
        .iter()
        .filter(|(_, v)| **v != 0)
        .map(|(k, v)| (k.as_str(), *v))
        .collect();
    if nonzero.is_empty() {
        return String::new();
    }
    serde_json::to_string(&nonzero).unwrap_or_default()
}
