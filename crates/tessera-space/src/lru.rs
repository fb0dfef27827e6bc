//! The LRU job
//!
//! Only mountpaths filled past the high watermark are touched. Candidates
//! are collected into a bounded per-mountpath heap ordered by access time
//! (the heap keeps the oldest, shedding the newest), then evicted -
//! copies before primaries - until the mountpath is back under the low
//! watermark or the time budget runs out. A primary that still has copies
//! gives up one copy instead of the object itself.

use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use walkdir::WalkDir;

use tessera_core::{Lom, Tctx};
use tessera_fs::capacity::statfs_mountpath;
use tessera_fs::{Capacity, ContentType, Mountpath};
use tessera_stats::{Tracker, LRU_EVICT_COUNT, LRU_EVICT_SIZE};

/// Bound on the per-mountpath candidate heap
pub const MAX_LRU_CANDIDATES: usize = 4096;

#[derive(Debug)]
enum Action {
    /// Evict this replica
    Copy,
    /// Keep the primary, drop this one copy of it
    DemoteCopy(PathBuf),
    /// Evict the object and its cache entry
    Primary { ord: usize, digest: u64, uname: String },
}

struct Candidate {
    atime: i64,
    size: i64,
    fqn: PathBuf,
    action: Action,
}

// max-heap by atime: the top is the newest, which is what a full heap sheds
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.atime.cmp(&other.atime)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.atime == other.atime
    }
}

impl Eq for Candidate {}

/// One LRU pass over all mountpaths, one worker per mountpath
pub(crate) fn run(ctx: &Arc<Tctx>, tracker: &Arc<Tracker>) {
    let started = Instant::now();
    let results: Vec<(u64, u64)> = thread::scope(|s| {
        let handles: Vec<_> = ctx
            .mountpaths
            .iter()
            .map(|mpath| {
                let mpath = Arc::clone(mpath);
                s.spawn(move || lru_mountpath(ctx, &mpath))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or((0, 0))).collect()
    });

    let (mut evicted, mut freed) = (0u64, 0u64);
    for (n, bytes) in results {
        evicted += n;
        freed += bytes;
    }
    if evicted > 0 {
        tracker.add(LRU_EVICT_COUNT, evicted as i64);
        tracker.add(LRU_EVICT_SIZE, freed as i64);
    }
    info!(
        evicted,
        freed,
        took_ms = started.elapsed().as_millis() as u64,
        "lru done"
    );
}

fn lru_mountpath(ctx: &Arc<Tctx>, mpath: &Arc<Mountpath>) -> (u64, u64) {
    let cap = match statfs_mountpath(&mpath.path) {
        Ok(cap) => cap,
        Err(e) => {
            warn!("lru: {}: {e}", mpath.path.display());
            return (0, 0);
        }
    };
    lru_mountpath_at(ctx, mpath, cap)
}

/// LRU one mountpath given its capacity reading
pub(crate) fn lru_mountpath_at(
    ctx: &Arc<Tctx>,
    mpath: &Arc<Mountpath>,
    cap: Capacity,
) -> (u64, u64) {
    let space = &ctx.config.space;
    if i64::from(cap.pct_used) <= space.lru_high_wm {
        return (0, 0);
    }
    let usable = cap.used + cap.avail;
    let to_free = (i64::from(cap.pct_used) - space.lru_low_wm) as u64 * usable / 100;
    let budget = space.job_budget();
    let dont_evict_ns = space.dont_evict_time().as_nanos() as i64;
    let now_ns = unix_now_ns();
    let started = Instant::now();

    // collect: bounded heap of the coldest objects
    let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(MAX_LRU_CANDIDATES + 1);
    for entry in WalkDir::new(&mpath.path).into_iter().filter_map(|e| e.ok()) {
        if started.elapsed() > budget {
            warn!("lru: {} out of scan budget", mpath.path.display());
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(parsed) = ctx.mountpaths.parse_fqn(entry.path()) else {
            continue;
        };
        if parsed.content_type != ContentType::Object {
            continue;
        }
        // a missing bucket is cleanup's problem, not lru's
        let Ok(mut lom) = Lom::from_fqn(ctx, entry.path()) else {
            continue;
        };
        if !lom.lru_enabled() {
            continue;
        }
        if lom.from_fs().is_err() {
            continue;
        }
        let md = lom.lmeta();
        // the cache may hold a fresher access time not yet written back
        let atime = ctx
            .lcache
            .lookup(parsed.mpath.ord, parsed.digest, &md.uname)
            .map_or(md.atime, |cached| cached.atime.max(md.atime));
        if now_ns.saturating_sub(atime) < dont_evict_ns {
            continue;
        }

        let action = if lom.is_copy() {
            Action::Copy
        } else if let Some(victim) = lom.copies().keys().next() {
            Action::DemoteCopy(victim.clone())
        } else {
            Action::Primary {
                ord: parsed.mpath.ord,
                digest: parsed.digest,
                uname: md.uname.clone(),
            }
        };
        heap.push(Candidate {
            atime,
            size: md.size,
            fqn: entry.path().to_path_buf(),
            action,
        });
        if heap.len() > MAX_LRU_CANDIDATES {
            heap.pop(); // shed the newest
        }
    }

    // evict: copies first, then primaries, each coldest-first
    let mut candidates = heap.into_vec();
    candidates.sort_by_key(|c| (matches!(c.action, Action::Primary { .. }), c.atime));

    let (mut evicted, mut freed) = (0u64, 0u64);
    for cand in candidates {
        if freed >= to_free {
            break;
        }
        if started.elapsed() > budget {
            warn!("lru: {} out of evict budget", mpath.path.display());
            break;
        }
        let target = match &cand.action {
            Action::DemoteCopy(victim) => victim.as_path(),
            _ => cand.fqn.as_path(),
        };
        match std::fs::remove_file(target) {
            Ok(()) => {
                if let Action::Primary { ord, digest, uname } = &cand.action {
                    ctx.lcache.remove(*ord, *digest, uname);
                }
                evicted += 1;
                freed += cand.size.max(0) as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("lru: {}: {e}", target.display()),
        }
    }
    (evicted, freed)
}

fn unix_now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
