//! Tessera space manager
//!
//! Best-effort garbage collection and least-recently-used eviction, driven
//! by capacity watermarks. Two bucket-independent jobs:
//!
//! - `cleanup` removes stale workfiles and objects retained past their
//!   bucket's deletion
//! - `lru` evicts cold objects from mountpaths above the high watermark
//!   until they drop back under the low watermark
//!
//! At most one instance of each job runs per target; re-triggering a
//! running job is a no-op. Both jobs are bounded per mountpath by a time
//! budget and report their work to the stats tracker.
//!
//! The manager implements [`TargetHooks`] so the stats ticker reaches it
//! through the target context: install it with [`SpaceManager::attach`]
//! and a crossed capacity watermark kicks `cleanup` + `lru` in the
//! background.

mod cleanup;
mod lru;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use tessera_common::Error;
use tessera_core::{TargetHooks, Tctx};
use tessera_fs::CapStatus;
use tessera_stats::Tracker;

pub use lru::MAX_LRU_CANDIDATES;

/// The space manager; clones share one set of single-flight jobs
#[derive(Clone)]
pub struct SpaceManager {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<Tctx>,
    tracker: Arc<Tracker>,
    cleanup_running: AtomicBool,
    lru_running: AtomicBool,
}

impl SpaceManager {
    #[must_use]
    pub fn new(ctx: Arc<Tctx>, tracker: Arc<Tracker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                tracker,
                cleanup_running: AtomicBool::new(false),
                lru_running: AtomicBool::new(false),
            }),
        }
    }

    /// Register this manager as the context's collaborator, completing
    /// the capacity-trigger path from the stats ticker
    pub fn attach(&self, ctx: &Tctx) {
        ctx.set_hooks(Arc::new(self.clone()));
    }

    /// Run `cleanup` then `lru` in the background; the reaction to a
    /// crossed capacity watermark. Requires a tokio runtime.
    pub fn kick(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.run_cleanup();
            inner.run_lru();
        });
    }

    /// Run the cleanup job to completion; returns false when an instance
    /// is already running
    pub fn run_cleanup(&self) -> bool {
        self.inner.run_cleanup()
    }

    /// Run the LRU job to completion; returns false when an instance is
    /// already running
    pub fn run_lru(&self) -> bool {
        self.inner.run_lru()
    }
}

impl Inner {
    fn run_cleanup(&self) -> bool {
        if self.cleanup_running.swap(true, Ordering::AcqRel) {
            info!("cleanup: already running");
            return false;
        }
        cleanup::run(&self.ctx, &self.tracker);
        self.cleanup_running.store(false, Ordering::Release);
        true
    }

    fn run_lru(&self) -> bool {
        if self.lru_running.swap(true, Ordering::AcqRel) {
            info!("lru: already running");
            return false;
        }
        lru::run(&self.ctx, &self.tracker);
        self.lru_running.store(false, Ordering::Release);
        true
    }
}

/// Capacity events route here from the stats ticker. The health-check
/// requests stay with the embedding target; an unadorned space manager
/// can only log them.
impl TargetHooks for SpaceManager {
    fn fshc(&self, err: &Error, fqn: &Path) {
        error!(
            "health check requested for {} ({err}); no checker attached",
            fqn.display()
        );
    }

    fn soft_fshc(&self) {
        warn!("full mountpath health check requested; no checker attached");
    }

    fn oos(&self, cs: &CapStatus) {
        warn!(
            "capacity watermark crossed (max {}%, oos: {}); running cleanup/lru",
            cs.pct_max, cs.oos
        );
        self.kick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tessera_common::{Bck, Config};
    use tessera_core::{Bmd, BucketProps, NopHooks};
    use tessera_stats::{Kind, Trunner, CLEANUP_STORE_COUNT, LRU_EVICT_COUNT};

    fn test_mgr() -> (Vec<TempDir>, SpaceManager) {
        let dirs: Vec<_> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let mut config = Config::default();
        config.mountpaths = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let ctx = Tctx::new(Arc::new(config), Arc::new(NopHooks)).unwrap();
        let tracker = Arc::new(Tracker::new());
        reg_space_metrics(&tracker);
        (dirs, SpaceManager::new(ctx, tracker))
    }

    fn reg_space_metrics(tracker: &Tracker) {
        tracker
            .register(tessera_stats::CLEANUP_STORE_COUNT, Kind::Counter)
            .unwrap();
        tracker
            .register(tessera_stats::CLEANUP_STORE_SIZE, Kind::Size)
            .unwrap();
        tracker
            .register(tessera_stats::LRU_EVICT_COUNT, Kind::Counter)
            .unwrap();
        tracker
            .register(tessera_stats::LRU_EVICT_SIZE, Kind::Size)
            .unwrap();
    }

    #[test]
    fn test_jobs_are_single_flight() {
        let (_dirs, mgr) = test_mgr();

        // a held flag models a running instance: re-trigger is a no-op
        mgr.inner.cleanup_running.store(true, Ordering::Release);
        assert!(!mgr.run_cleanup());
        mgr.inner.cleanup_running.store(false, Ordering::Release);
        assert!(mgr.run_cleanup());

        mgr.inner.lru_running.store(true, Ordering::Release);
        assert!(!mgr.run_lru());
        mgr.inner.lru_running.store(false, Ordering::Release);
        assert!(mgr.run_lru());
    }

    #[test]
    fn test_empty_mountpaths_are_fine() {
        let (_dirs, mgr) = test_mgr();
        assert!(mgr.run_cleanup());
        assert!(mgr.run_lru());
        assert_eq!(mgr.inner.tracker.get(CLEANUP_STORE_COUNT), 0);
        assert_eq!(mgr.inner.tracker.get(LRU_EVICT_COUNT), 0);
    }

    // the full trigger path: stats ticker observes a crossed watermark,
    // the attached manager runs both jobs; a re-trigger while the jobs
    // are running is a no-op
    #[tokio::test]
    async fn test_capacity_watermark_runs_jobs_once() {
        let dirs: Vec<_> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        let mut config = Config::default();
        config.mountpaths = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        config.space.cleanup_wm = 80;
        let config = Arc::new(config);

        let ctx = Tctx::new(Arc::clone(&config), Arc::new(NopHooks)).unwrap();
        let tracker = Arc::new(Tracker::new());
        reg_space_metrics(&tracker);
        let mgr = SpaceManager::new(Arc::clone(&ctx), Arc::clone(&tracker));
        mgr.attach(&ctx);

        let bck = Bck::local("b");
        let mut bmd = Bmd::default();
        bmd.add(bck.clone(), BucketProps::with_defaults(&ctx.config, 1));
        ctx.bowner.put(bmd);

        // something for cleanup to collect: a workfile past its grace
        let stale = ctx.mountpaths.get(0).unwrap().work_fqn(&bck, "orphan.tar", "put");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, vec![0u8; 1024]).unwrap();
        let old = filetime::FileTime::from_unix_time(
            filetime::FileTime::now().unix_seconds() - 2 * 3600,
            0,
        );
        filetime::set_file_times(&stale, old, old).unwrap();

        let mut stats = Trunner::new(Arc::clone(&ctx), None);

        // one tick past the cleanup watermark
        let cs = CapStatus {
            pct_max: 85,
            pct_avg: 85,
            ..Default::default()
        };
        stats.on_capacity(&config, cs, Instant::now(), false);

        // the kicked jobs land in the background
        for _ in 0..100 {
            if tracker.get(CLEANUP_STORE_COUNT) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!stale.exists());
        assert_eq!(tracker.get(CLEANUP_STORE_COUNT), 1);

        // let the first pass fully settle, then model both jobs running:
        // a second tick must not re-run them
        tokio::time::sleep(Duration::from_millis(200)).await;
        mgr.inner.cleanup_running.store(true, Ordering::Release);
        mgr.inner.lru_running.store(true, Ordering::Release);
        let cs = CapStatus {
            pct_max: 83,
            pct_avg: 83,
            ..Default::default()
        };
        stats.on_capacity(&config, cs, Instant::now(), false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tracker.get(CLEANUP_STORE_COUNT), 1);
        assert_eq!(tracker.get(LRU_EVICT_COUNT), 0);
        mgr.inner.cleanup_running.store(false, Ordering::Release);
        mgr.inner.lru_running.store(false, Ordering::Release);
    }
}
