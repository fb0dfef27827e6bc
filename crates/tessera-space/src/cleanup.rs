//! The cleanup job
//!
//! Walks each mountpath within its time budget and removes what no longer
//! earns its keep: workfiles past the grace period (orphans of aborted
//! PUTs and transforms) and objects whose bucket has since been deleted
//! but whose files were retained.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};
use walkdir::WalkDir;

use tessera_core::Tctx;
use tessera_fs::{ContentType, Mountpath};
use tessera_stats::{Tracker, CLEANUP_STORE_COUNT, CLEANUP_STORE_SIZE};

/// One cleanup pass over all mountpaths, one worker per mountpath
pub(crate) fn run(ctx: &Arc<Tctx>, tracker: &Arc<Tracker>) {
    let started = Instant::now();
    let (mut removed, mut freed) = (0u64, 0u64);

    let results: Vec<(u64, u64)> = thread::scope(|s| {
        let handles: Vec<_> = ctx
            .mountpaths
            .iter()
            .map(|mpath| {
                let mpath = Arc::clone(mpath);
                s.spawn(move || cleanup_mountpath(ctx, &mpath))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or((0, 0))).collect()
    });
    for (n, bytes) in results {
        removed += n;
        freed += bytes;
    }

    if removed > 0 {
        tracker.add(CLEANUP_STORE_COUNT, removed as i64);
        tracker.add(CLEANUP_STORE_SIZE, freed as i64);
    }
    info!(
        removed,
        freed,
        took_ms = started.elapsed().as_millis() as u64,
        "cleanup done"
    );
}

fn cleanup_mountpath(ctx: &Arc<Tctx>, mpath: &Arc<Mountpath>) -> (u64, u64) {
    let budget = ctx.config.space.job_budget();
    let grace = ctx.config.space.workfile_grace();
    let bmd = ctx.bowner.get();
    let started = Instant::now();
    let (mut removed, mut freed) = (0u64, 0u64);

    for entry in WalkDir::new(&mpath.path).into_iter().filter_map(|e| e.ok()) {
        if started.elapsed() > budget {
            warn!("cleanup: {} out of time budget", mpath.path.display());
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(parsed) = ctx.mountpaths.parse_fqn(entry.path()) else {
            continue; // not ours to judge
        };
        let stale = match parsed.content_type {
            ContentType::Work => is_older_than(entry.path(), grace),
            // deleted-but-retained: the bucket is gone from the BMD
            ContentType::Object | ContentType::Ec => {
                parsed.bck.is_local() && bmd.props(&parsed.bck).is_none()
            }
        };
        if !stale {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                freed += size;
                if parsed.content_type == ContentType::Object {
                    let uname =
                        tessera_common::make_uname(&parsed.bck, &parsed.objname);
                    ctx.lcache.remove(parsed.mpath.ord, parsed.digest, &uname);
                }
            }
            Err(e) => warn!("cleanup: {}: {e}", entry.path().display()),
        }
    }
    (removed, freed)
}

fn is_older_than(path: &Path, age: Duration) -> bool {
    let Ok(md) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = md.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(mtime)
        .map_or(false, |elapsed| elapsed > age)
}
