//! Disk statistics via /proc/diskstats
//!
//! The poller keeps the previous raw counters and converts deltas into
//! per-disk read/write throughput, average transfer sizes, and
//! utilization. Refreshes are capped: callers inside the stats period get
//! the cached snapshot. On systems without /proc the stats are empty.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const SECTOR_SIZE: u64 = 512;

/// Computed per-disk statistics over the last refresh interval
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskStat {
    /// Read throughput, bytes/sec
    pub rbps: i64,
    /// Average read size, bytes
    pub ravg: i64,
    /// Write throughput, bytes/sec
    pub wbps: i64,
    /// Average write size, bytes
    pub wavg: i64,
    /// Utilization, percent
    pub util: i64,
}

/// All discovered disks
pub type AllDiskStats = HashMap<String, DiskStat>;

/// Raw cumulative counters for one device
#[derive(Clone, Copy, Debug, Default)]
struct RawDisk {
    reads: u64,
    read_sectors: u64,
    writes: u64,
    write_sectors: u64,
    /// ms spent doing I/O (field 10 of /proc/diskstats)
    io_ms: u64,
}

struct PollState {
    prev: HashMap<String, RawDisk>,
    prev_at: Instant,
    cache: AllDiskStats,
    refreshed_once: bool,
}

/// Periodic /proc/diskstats poller with a refresh cap
pub struct DiskPoller {
    state: Mutex<PollState>,
}

impl DiskPoller {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PollState {
                prev: HashMap::new(),
                prev_at: Instant::now(),
                cache: AllDiskStats::new(),
                refreshed_once: false,
            }),
        }
    }

    /// Current stats; re-reads /proc/diskstats at most once per
    /// `refresh_cap`, otherwise returns the cached snapshot
    #[must_use]
    pub fn stats(&self, refresh_cap: Duration) -> AllDiskStats {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.refreshed_once && now.duration_since(state.prev_at) < refresh_cap {
            return state.cache.clone();
        }
        let Ok(content) = std::fs::read_to_string("/proc/diskstats") else {
            return state.cache.clone();
        };
        Self::apply(&mut state, &content, now);
        state.cache.clone()
    }

    fn apply(state: &mut PollState, content: &str, now: Instant) {
        let cur = parse_diskstats(content);
        let elapsed = now.duration_since(state.prev_at);
        if state.refreshed_once && !elapsed.is_zero() {
            let mut out = AllDiskStats::with_capacity(cur.len());
            for (disk, raw) in &cur {
                let Some(prev) = state.prev.get(disk) else {
                    continue;
                };
                out.insert(disk.clone(), compute(prev, raw, elapsed));
            }
            state.cache = out;
        }
        state.prev = cur;
        state.prev_at = now;
        state.refreshed_once = true;
    }

    /// Test hook: feed synthetic /proc/diskstats content
    #[doc(hidden)]
    pub fn refresh_from_str(&self, content: &str, now: Instant) -> AllDiskStats {
        let mut state = self.state.lock();
        Self::apply(&mut state, content, now);
        state.cache.clone()
    }
}

impl Default for DiskPoller {
    fn default() -> Self {
        Self::new()
    }
}

fn compute(prev: &RawDisk, cur: &RawDisk, elapsed: Duration) -> DiskStat {
    let ms = elapsed.as_millis().max(1) as u64;
    let d_reads = cur.reads.saturating_sub(prev.reads);
    let d_rsect = cur.read_sectors.saturating_sub(prev.read_sectors);
    let d_writes = cur.writes.saturating_sub(prev.writes);
    let d_wsect = cur.write_sectors.saturating_sub(prev.write_sectors);
    let d_io_ms = cur.io_ms.saturating_sub(prev.io_ms);

    DiskStat {
        rbps: (d_rsect * SECTOR_SIZE * 1000 / ms) as i64,
        ravg: if d_reads == 0 {
            0
        } else {
            (d_rsect * SECTOR_SIZE / d_reads) as i64
        },
        wbps: (d_wsect * SECTOR_SIZE * 1000 / ms) as i64,
        wavg: if d_writes == 0 {
            0
        } else {
            (d_wsect * SECTOR_SIZE / d_writes) as i64
        },
        util: (d_io_ms * 100 / ms).min(100) as i64,
    }
}

/// Parse /proc/diskstats, skipping pseudo devices
fn parse_diskstats(content: &str) -> HashMap<String, RawDisk> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name reads _ sectors _ writes _ sectors _ _ io_ms ...
        if fields.len() < 13 {
            continue;
        }
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") {
            continue;
        }
        let num = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        out.insert(
            name.to_owned(),
            RawDisk {
                reads: num(3),
                read_sectors: num(5),
                writes: num(7),
                write_sectors: num(9),
                io_ms: num(12),
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(name: &str, reads: u64, rsect: u64, writes: u64, wsect: u64, io_ms: u64) -> String {
        format!("   8       0 {name} {reads} 10 {rsect} 100 {writes} 20 {wsect} 200 0 {io_ms} 300\n")
    }

    #[test]
    fn test_parse_skips_pseudo_devices() {
        let content = [
            line("sda", 1, 2, 3, 4, 5),
            line("loop0", 1, 2, 3, 4, 5),
            line("ram1", 1, 2, 3, 4, 5),
            line("dm-0", 1, 2, 3, 4, 5),
        ]
        .concat();
        let parsed = parse_diskstats(&content);
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("sda"));
    }

    #[test]
    fn test_delta_computation() {
        let poller = DiskPoller::new();
        let t0 = Instant::now();
        poller.refresh_from_str(&line("sda", 0, 0, 0, 0, 0), t0);

        // one second later: 2048 sectors read in 100 reads, half-busy
        let stats = poller.refresh_from_str(
            &line("sda", 100, 2048, 50, 4096, 500),
            t0 + Duration::from_secs(1),
        );
        let sda = stats["sda"];
        assert_eq!(sda.rbps, 2048 * 512);
        assert_eq!(sda.ravg, 2048 * 512 / 100);
        assert_eq!(sda.wbps, 4096 * 512);
        assert_eq!(sda.wavg, 4096 * 512 / 50);
        assert_eq!(sda.util, 50);
    }

    #[test]
    fn test_util_capped_at_100() {
        let poller = DiskPoller::new();
        let t0 = Instant::now();
        poller.refresh_from_str(&line("sda", 0, 0, 0, 0, 0), t0);
        let stats =
            poller.refresh_from_str(&line("sda", 1, 1, 1, 1, 9999), t0 + Duration::from_secs(1));
        assert_eq!(stats["sda"].util, 100);
    }

    #[test]
    fn test_first_poll_yields_nothing() {
        let poller = DiskPoller::new();
        let stats = poller.refresh_from_str(&line("sda", 5, 5, 5, 5, 5), Instant::now());
        assert!(stats.is_empty());
    }
}
