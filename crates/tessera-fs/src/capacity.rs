//! Capacity refresh across mountpaths
//!
//! statvfs every mountpath, deduplicate shared filesystems by fs id, and
//! roll the result up into a target-wide summary with min/avg/max used
//! percentages and an out-of-space verdict.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use tessera_common::{Config, Error, Result};

use crate::mountpath::MountpathRegistry;

/// Used/available state of one filesystem
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Capacity {
    pub used: u64,
    pub avail: u64,
    pub pct_used: i32,
}

/// Per-mountpath capacity, disks, and alert
#[derive(Clone, Debug, Default, Serialize)]
pub struct Cdf {
    pub fs_id: u64,
    pub disks: Vec<String>,
    pub capacity: Capacity,
    /// Set when the mountpath itself is at or over the OOS watermark
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

/// Target-wide capacity summary, keyed by mountpath
#[derive(Clone, Debug, Default, Serialize)]
pub struct TargetCdf {
    pub pct_max: i32,
    pub pct_avg: i32,
    pub pct_min: i32,
    pub total_used: u64,
    pub total_avail: u64,
    pub mountpaths: BTreeMap<String, Cdf>,
}

impl TargetCdf {
    #[must_use]
    pub fn has_alerts(&self) -> bool {
        self.mountpaths.values().any(|cdf| cdf.alert.is_some())
    }
}

/// The verdict of one capacity refresh
#[derive(Clone, Copy, Debug, Default)]
pub struct CapStatus {
    pub total_used: u64,
    pub total_avail: u64,
    pub pct_max: i32,
    pub pct_avg: i32,
    pub oos: bool,
}

impl CapStatus {
    /// Capacity error to surface, if any: OOS beats the high watermark
    #[must_use]
    pub fn err(&self, config: &Config) -> Option<Error> {
        if self.oos {
            return Some(Error::OutOfSpace {
                pct_max: self.pct_max,
            });
        }
        if i64::from(self.pct_max) > config.space.lru_high_wm {
            return Some(Error::CapacityExceeded {
                pct_max: self.pct_max,
                wm: config.space.lru_high_wm,
            });
        }
        None
    }
}

/// statvfs-equivalent for one mountpath root
pub fn statfs_mountpath(path: &std::path::Path) -> Result<Capacity> {
    let total = fs2::total_space(path).map_err(|e| Error::unavailable(path, e))?;
    let avail = fs2::available_space(path).map_err(|e| Error::unavailable(path, e))?;
    let free = fs2::free_space(path).map_err(|e| Error::unavailable(path, e))?;
    let used = total.saturating_sub(free);
    Ok(Capacity {
        used,
        avail,
        pct_used: pct(used, avail),
    })
}

fn pct(used: u64, avail: u64) -> i32 {
    let usable = used + avail;
    if usable == 0 {
        return 0;
    }
    (used * 100 / usable) as i32
}

/// Refresh capacity across all mountpaths into `tcdf` and summarize
pub fn cap_refresh(
    config: &Config,
    registry: &MountpathRegistry,
    tcdf: &mut TargetCdf,
) -> Result<CapStatus> {
    let oos_wm = config.space.oos_wm;
    let mut seen_fs = HashSet::new();
    let mut cs = CapStatus {
        pct_max: 0,
        pct_avg: 0,
        oos: false,
        ..Default::default()
    };
    let (mut pct_min, mut pct_sum, mut n) = (i32::MAX, 0i64, 0i64);

    tcdf.mountpaths.clear();
    for mpath in registry.iter() {
        let capacity = statfs_mountpath(&mpath.path)?;
        let alert = (i64::from(capacity.pct_used) >= oos_wm).then(|| "OOS".to_owned());
        if seen_fs.insert(mpath.fs_id) {
            cs.total_used += capacity.used;
            cs.total_avail += capacity.avail;
        }
        cs.pct_max = cs.pct_max.max(capacity.pct_used);
        pct_min = pct_min.min(capacity.pct_used);
        pct_sum += i64::from(capacity.pct_used);
        n += 1;

        tcdf.mountpaths.insert(
            mpath.path.display().to_string(),
            Cdf {
                fs_id: mpath.fs_id,
                disks: mpath.disks.clone(),
                capacity,
                alert,
            },
        );
    }

    cs.pct_avg = if n == 0 { 0 } else { (pct_sum / n) as i32 };
    cs.oos = i64::from(cs.pct_max) >= oos_wm;

    tcdf.pct_max = cs.pct_max;
    tcdf.pct_avg = cs.pct_avg;
    tcdf.pct_min = if pct_min == i32::MAX { 0 } else { pct_min };
    tcdf.total_used = cs.total_used;
    tcdf.total_avail = cs.total_avail;
    Ok(cs)
}
