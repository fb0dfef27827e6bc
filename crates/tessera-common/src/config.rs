//! Configuration for the Tessera target core
//!
//! Durations are carried as millisecond fields with accessor methods; the
//! whole tree is serde-loadable and validated once at startup. Invalid
//! values are a `config` error and fatal.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumType;
use crate::error::{Error, Result};

/// Root configuration for a Tessera target
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mountpath roots this target owns
    pub mountpaths: Vec<PathBuf>,
    pub periodic: PeriodicConf,
    pub disk: DiskConf,
    pub space: SpaceConf,
    pub lcache: LcacheConf,
    pub fshc: FshcConf,
    pub checksum: CksumConf,
    pub versioning: VersioningConf,
    /// Optional StatsD sink; absent disables the client
    pub statsd: Option<StatsdConf>,
}

impl Config {
    /// Validate watermark ordering and periods; called once at startup
    pub fn validate(&self) -> Result<()> {
        let s = &self.space;
        if !(0 < s.cleanup_wm
            && s.cleanup_wm <= 100
            && 0 < s.lru_low_wm
            && s.lru_low_wm < s.lru_high_wm
            && s.lru_high_wm < s.oos_wm
            && s.oos_wm <= 100)
        {
            return Err(Error::config(format!(
                "invalid space watermarks: cleanup {} in (0, 100], low {} < high {} < oos {} <= 100",
                s.cleanup_wm, s.lru_low_wm, s.lru_high_wm, s.oos_wm
            )));
        }
        if self.periodic.stats_time_ms < 1_000 {
            return Err(Error::config(format!(
                "periodic.stats_time {}ms is below the 1s floor",
                self.periodic.stats_time_ms
            )));
        }
        if self.fshc.enabled && (self.fshc.soft_errs == 0 || self.fshc.soft_err_time_ms == 0) {
            return Err(Error::config(
                "fshc.soft_errs and fshc.soft_err_time must be positive",
            ));
        }
        if !(0..=100).contains(&self.disk.disk_util_low_wm) {
            return Err(Error::config(format!(
                "disk.disk_util_low_wm {} out of range",
                self.disk.disk_util_low_wm
            )));
        }
        Ok(())
    }
}

/// Periodic task intervals
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicConf {
    /// Stats roll-up period
    pub stats_time_ms: u64,
    /// Force one stats log line at least this often even when idle
    pub max_stats_log_interval_ms: u64,
}

impl PeriodicConf {
    #[must_use]
    pub fn stats_time(&self) -> Duration {
        Duration::from_millis(self.stats_time_ms)
    }

    #[must_use]
    pub fn max_stats_log_interval(&self) -> Duration {
        Duration::from_millis(self.max_stats_log_interval_ms)
    }
}

impl Default for PeriodicConf {
    fn default() -> Self {
        Self {
            stats_time_ms: 10_000,
            max_stats_log_interval_ms: 60_000,
        }
    }
}

/// Disk stats polling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConf {
    /// Utilization % under which a disk counts as idle
    pub disk_util_low_wm: i64,
    /// Minimum interval between /proc/diskstats refreshes
    pub iostat_time_ms: u64,
}

impl DiskConf {
    #[must_use]
    pub fn iostat_time(&self) -> Duration {
        Duration::from_millis(self.iostat_time_ms)
    }
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            disk_util_low_wm: 20,
            iostat_time_ms: 2_000,
        }
    }
}

/// Capacity watermarks and space-manager budgets
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConf {
    /// Capacity % above which cleanup is auto-triggered
    pub cleanup_wm: i64,
    /// LRU stops once pct-used drops to this
    pub lru_low_wm: i64,
    /// LRU starts on mountpaths above this
    pub lru_high_wm: i64,
    /// Out-of-space threshold
    pub oos_wm: i64,
    /// Workfiles younger than this survive cleanup
    pub workfile_grace_ms: u64,
    /// Per-mountpath time budget for one lru/cleanup pass
    pub job_budget_ms: u64,
    /// Objects accessed within this window are never LRU-evicted
    pub dont_evict_time_ms: u64,
}

impl SpaceConf {
    #[must_use]
    pub fn workfile_grace(&self) -> Duration {
        Duration::from_millis(self.workfile_grace_ms)
    }

    #[must_use]
    pub fn job_budget(&self) -> Duration {
        Duration::from_millis(self.job_budget_ms)
    }

    #[must_use]
    pub fn dont_evict_time(&self) -> Duration {
        Duration::from_millis(self.dont_evict_time_ms)
    }
}

impl Default for SpaceConf {
    fn default() -> Self {
        Self {
            cleanup_wm: 65,
            lru_low_wm: 75,
            lru_high_wm: 90,
            oos_wm: 95,
            workfile_grace_ms: 60 * 60 * 1000,
            job_budget_ms: 30_000,
            dont_evict_time_ms: 2 * 60 * 60 * 1000,
        }
    }
}

/// LOM cache eviction schedule, keyed by memory pressure
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LcacheConf {
    pub oom: PressureConf,
    pub extreme: PressureConf,
    pub high: PressureConf,
    pub normal: PressureConf,
}

/// Eviction age and re-tick interval for one pressure level
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PressureConf {
    pub evict_age_ms: u64,
    pub interval_ms: u64,
}

impl PressureConf {
    #[must_use]
    pub fn evict_age(&self) -> Duration {
        Duration::from_millis(self.evict_age_ms)
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for LcacheConf {
    fn default() -> Self {
        const MIN: u64 = 60 * 1000;
        Self {
            oom: PressureConf {
                evict_age_ms: MIN,
                interval_ms: 10 * 1000,
            },
            extreme: PressureConf {
                evict_age_ms: 5 * MIN,
                interval_ms: MIN,
            },
            high: PressureConf {
                evict_age_ms: 10 * MIN,
                interval_ms: 2 * MIN,
            },
            normal: PressureConf {
                evict_age_ms: 60 * MIN,
                interval_ms: 10 * MIN,
            },
        }
    }
}

/// Filesystem health checker thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FshcConf {
    pub enabled: bool,
    /// Soft-error count that triggers a full health check ...
    pub soft_errs: i64,
    /// ... when raised within this window
    pub soft_err_time_ms: u64,
}

impl FshcConf {
    #[must_use]
    pub fn soft_err_time(&self) -> Duration {
        Duration::from_millis(self.soft_err_time_ms)
    }
}

impl Default for FshcConf {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_errs: 10,
            soft_err_time_ms: 10_000,
        }
    }
}

/// Cluster-default checksum settings; buckets may override
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CksumConf {
    #[serde(rename = "type")]
    pub ty: ChecksumType,
    pub validate_cold_get: bool,
}

impl Default for CksumConf {
    fn default() -> Self {
        Self {
            ty: ChecksumType::XxHash64,
            validate_cold_get: true,
        }
    }
}

/// Cluster-default versioning settings; buckets may override
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConf {
    pub enabled: bool,
}

impl Default for VersioningConf {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// StatsD sink
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsdConf {
    /// host:port of the UDP sink
    pub server: String,
    /// Metric namespace prefix
    pub prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_bad_watermarks() {
        let mut config = Config::default();
        config.space.lru_low_wm = 92; // above high_wm
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.space.oos_wm = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stats_time_floor() {
        let mut config = Config::default();
        config.periodic.stats_time_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = Config::default();
        let js = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&js).unwrap();
        assert_eq!(back.space.lru_high_wm, 90);
        assert_eq!(back.checksum.ty, ChecksumType::XxHash64);
        assert_eq!(back.lcache.oom.interval_ms, 10_000);
    }
}
