//! Collaborator interfaces
//!
//! The core escalates to (but does not own) the filesystem health checker
//! and the space manager, and consumes a coarse memory-pressure signal
//! from the memory subsystem.

use std::path::Path;

use tessera_common::Error;
use tessera_fs::CapStatus;

/// Callbacks into the embedding target
pub trait TargetHooks: Send + Sync {
    /// A mountpath I/O error was observed at `fqn`; check that path
    fn fshc(&self, err: &Error, fqn: &Path);

    /// Soft-error burst: check all mountpaths
    fn soft_fshc(&self);

    /// A capacity watermark was crossed: run space cleanup/LRU
    fn oos(&self, cs: &CapStatus);
}

/// Hooks that do nothing; for tests and standalone embedding
#[derive(Debug, Default)]
pub struct NopHooks;

impl TargetHooks for NopHooks {
    fn fshc(&self, _err: &Error, _fqn: &Path) {}
    fn soft_fshc(&self) {}
    fn oos(&self, _cs: &CapStatus) {}
}

/// Coarse memory pressure, most severe last
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemPressure {
    Normal,
    High,
    Extreme,
    Oom,
}

/// Source of the memory-pressure signal
pub trait MemPressureSource: Send + Sync {
    fn pressure(&self) -> MemPressure;
}

/// /proc/meminfo-backed pressure source; reports Normal where /proc is
/// unavailable
#[derive(Debug, Default)]
pub struct ProcMeminfo;

impl MemPressureSource for ProcMeminfo {
    fn pressure(&self) -> MemPressure {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(content) => pressure_from_meminfo(&content),
            Err(_) => MemPressure::Normal,
        }
    }
}

fn pressure_from_meminfo(content: &str) -> MemPressure {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            line.strip_prefix(name)?
                .trim_start_matches(':')
                .split_whitespace()
                .next()?
                .parse::<u64>()
                .ok()
        })
    };
    let (Some(total), Some(avail)) = (field("MemTotal"), field("MemAvailable")) else {
        return MemPressure::Normal;
    };
    if total == 0 {
        return MemPressure::Normal;
    }
    match avail * 100 / total {
        0..=1 => MemPressure::Oom,
        2..=4 => MemPressure::Extreme,
        5..=9 => MemPressure::High,
        _ => MemPressure::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meminfo(total_kb: u64, avail_kb: u64) -> String {
        format!("MemTotal:       {total_kb} kB\nMemFree:         1024 kB\nMemAvailable:   {avail_kb} kB\n")
    }

    #[test]
    fn test_pressure_levels() {
        assert_eq!(
            pressure_from_meminfo(&meminfo(100_000, 50_000)),
            MemPressure::Normal
        );
        assert_eq!(
            pressure_from_meminfo(&meminfo(100_000, 8_000)),
            MemPressure::High
        );
        assert_eq!(
            pressure_from_meminfo(&meminfo(100_000, 3_000)),
            MemPressure::Extreme
        );
        assert_eq!(
            pressure_from_meminfo(&meminfo(100_000, 900)),
            MemPressure::Oom
        );
    }

    #[test]
    fn test_garbage_meminfo_is_normal() {
        assert_eq!(pressure_from_meminfo("nonsense"), MemPressure::Normal);
        assert_eq!(
            pressure_from_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB\n"),
            MemPressure::Normal
        );
    }

    #[test]
    fn test_pressure_ordering() {
        assert!(MemPressure::Oom > MemPressure::Extreme);
        assert!(MemPressure::Extreme > MemPressure::High);
        assert!(MemPressure::High > MemPressure::Normal);
    }
}
