//! LOM cache eviction runner
//!
//! One long-lived task. Each tick maps the current memory pressure to an
//! eviction-age threshold and the next tick interval, then walks every
//! cache stripe in parallel: entries accessed within the threshold stay;
//! older entries get their access time written through (when newer than
//! what the filesystem has) and are dropped. A pass that evicts less than
//! the size-ratio floor falls back to the relaxed tick interval.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::info;

use tessera_common::config::PressureConf;

use crate::ctx::Tctx;
use crate::hooks::{MemPressure, MemPressureSource};
use crate::lom::{Lmeta, Lom};

/// Evicting fewer entries than fit in this many bytes does not justify a
/// tighter tick
const MIN_EVICT_SIZE: usize = 256 * 1024;

fn min_evict_entries() -> u64 {
    (MIN_EVICT_SIZE / mem::size_of::<Lmeta>()) as u64
}

/// The background eviction task
pub struct LomCacheRunner {
    ctx: Arc<Tctx>,
    mem: Arc<dyn MemPressureSource>,
    stopping: Arc<AtomicBool>,
}

impl LomCacheRunner {
    #[must_use]
    pub fn new(ctx: Arc<Tctx>, mem: Arc<dyn MemPressureSource>) -> Self {
        Self {
            ctx,
            mem,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    fn schedule(&self, p: MemPressure) -> PressureConf {
        let lc = &self.ctx.config.lcache;
        match p {
            MemPressure::Oom => lc.oom,
            MemPressure::Extreme => lc.extreme,
            MemPressure::High => lc.high,
            MemPressure::Normal => lc.normal,
        }
    }

    /// Run until the stop channel fires; stop is cooperative and also
    /// checked per cache entry mid-pass
    pub async fn run(self, mut stop_rx: mpsc::Receiver<()>) {
        let mut next = self.ctx.config.lcache.normal.interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(next) => {}
                _ = stop_rx.recv() => {
                    self.stopping.store(true, Ordering::Relaxed);
                    info!("lom cache runner: stopping");
                    return;
                }
            }

            let pressure = self.mem.pressure();
            let age = self.schedule(pressure).evict_age();

            let (ctx, stopping) = (Arc::clone(&self.ctx), Arc::clone(&self.stopping));
            let (evicted, total) =
                tokio::task::spawn_blocking(move || evict_pass(&ctx, age, &stopping))
                    .await
                    .unwrap_or((0, 0));

            // not worth tightening the schedule for a trickle
            next = if evicted < min_evict_entries() {
                self.ctx.config.lcache.normal.interval()
            } else {
                self.schedule(self.mem.pressure()).interval()
            };
            info!(
                total = total - evicted,
                evicted,
                next_ms = next.as_millis() as u64,
                "lom cache eviction pass"
            );
        }
    }
}

/// One eviction pass over every stripe, one worker per mountpath.
/// Returns `(evicted, total)` entries seen.
pub fn evict_pass(ctx: &Arc<Tctx>, age: Duration, stopping: &AtomicBool) -> (u64, u64) {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64;
    let cutoff_ns = age.as_nanos() as i64;
    let evicted = AtomicU64::new(0);
    let total = AtomicU64::new(0);

    thread::scope(|s| {
        for ord in 0..ctx.mountpaths.len() {
            let (evicted, total) = (&evicted, &total);
            s.spawn(move || {
                for stripe in ctx.lcache.mountpath_stripes(ord) {
                    stripe.retain(|_, md| {
                        if stopping.load(Ordering::Relaxed) {
                            return true;
                        }
                        total.fetch_add(1, Ordering::Relaxed);
                        if now_ns.saturating_sub(md.atime) < cutoff_ns {
                            return true;
                        }
                        if md.atime != md.atime_fs {
                            // sync the filesystem before the entry is lost
                            if let Ok(lom) = Lom::from_lmeta(ctx, md) {
                                lom.flush_atime();
                            }
                        }
                        evicted.fetch_add(1, Ordering::Relaxed);
                        false
                    });
                }
            });
        }
    });
    (evicted.into_inner(), total.into_inner())
}
