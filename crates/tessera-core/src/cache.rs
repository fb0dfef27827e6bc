//! The LOM cache
//!
//! Per-mountpath, striped into a fixed power-of-two number of concurrent
//! maps keyed by uname. Entries are shared pointers to immutable metadata
//! records; `ReCache` installs a fresh record wholesale, so readers never
//! observe partial updates. Iteration tolerates concurrent stores and
//! deletes, and deleting inside a range pass is permitted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use dashmap::DashMap;

use tessera_common::Bck;

use crate::lom::Lmeta;

/// Stripes per mountpath; must stay a power of two
pub const LOM_CACHE_STRIPES: usize = 16;

const STRIPE_MASK: u64 = (LOM_CACHE_STRIPES - 1) as u64;

type Stripe = DashMap<String, Arc<Lmeta>>;

/// All cache stripes of one target, indexed `[mountpath ordinal][stripe]`
pub struct LomCache {
    mpaths: Vec<Vec<Stripe>>,
}

impl LomCache {
    #[must_use]
    pub(crate) fn new(num_mountpaths: usize) -> Self {
        let mpaths = (0..num_mountpaths)
            .map(|_| (0..LOM_CACHE_STRIPES).map(|_| Stripe::new()).collect())
            .collect();
        Self { mpaths }
    }

    /// The stripe holding a given uname digest on a given mountpath
    #[must_use]
    pub fn stripe(&self, ord: usize, digest: u64) -> &Stripe {
        &self.mpaths[ord][(digest & STRIPE_MASK) as usize]
    }

    #[must_use]
    pub fn lookup(&self, ord: usize, digest: u64, uname: &str) -> Option<Arc<Lmeta>> {
        self.stripe(ord, digest)
            .get(uname)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn store(&self, ord: usize, digest: u64, md: Arc<Lmeta>) {
        self.stripe(ord, digest).insert(md.uname.clone(), md);
    }

    pub fn remove(&self, ord: usize, digest: u64, uname: &str) {
        self.stripe(ord, digest).remove(uname);
    }

    /// All stripes of one mountpath
    #[must_use]
    pub fn mountpath_stripes(&self, ord: usize) -> &[Stripe] {
        &self.mpaths[ord]
    }

    /// Every stripe across every mountpath
    pub fn stripes(&self) -> impl Iterator<Item = &Stripe> {
        self.mpaths.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stripes().map(DashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes().all(DashMap::is_empty)
    }

    /// Drop every cached entry of one bucket; stripes are walked in
    /// parallel, one worker per mountpath
    pub fn evict_bucket(&self, bck: &Bck) -> usize {
        let prefix = format!("{}/{}/", bck.provider, bck.name);
        let evicted = AtomicUsize::new(0);
        thread::scope(|s| {
            for stripes in &self.mpaths {
                let (prefix, evicted) = (&prefix, &evicted);
                s.spawn(move || {
                    for stripe in stripes {
                        stripe.retain(|uname, _| {
                            let hit = uname.starts_with(prefix);
                            if hit {
                                evicted.fetch_add(1, Ordering::Relaxed);
                            }
                            !hit
                        });
                    }
                });
            }
        });
        evicted.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::{make_uname, uname_digest};

    fn entry(bck: &Bck, objname: &str) -> (u64, Arc<Lmeta>) {
        let uname = make_uname(bck, objname);
        let digest = uname_digest(&uname);
        (
            digest,
            Arc::new(Lmeta {
                uname,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_store_lookup_remove() {
        let cache = LomCache::new(2);
        let bck = Bck::local("b");
        let (digest, md) = entry(&bck, "o1");

        cache.store(1, digest, Arc::clone(&md));
        let got = cache.lookup(1, digest, &md.uname).unwrap();
        assert_eq!(got.uname, md.uname);

        // same uname on the other mountpath is a distinct slot
        assert!(cache.lookup(0, digest, &md.uname).is_none());

        cache.remove(1, digest, &md.uname);
        assert!(cache.lookup(1, digest, &md.uname).is_none());
    }

    #[test]
    fn test_striping_covers_all_digests() {
        let cache = LomCache::new(1);
        let bck = Bck::local("b");
        for i in 0..256 {
            let (digest, md) = entry(&bck, &format!("o{i}"));
            cache.store(0, digest, md);
        }
        assert_eq!(cache.len(), 256);
        // with 256 unames every stripe should see traffic
        assert!(cache.mountpath_stripes(0).iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn test_evict_bucket_is_selective() {
        let cache = LomCache::new(2);
        let victim = Bck::local("victim");
        let keeper = Bck::local("keep");
        for i in 0..64 {
            for (ord, bck) in [(0, &victim), (1, &keeper)] {
                let (digest, md) = entry(bck, &format!("o{i}"));
                cache.store(ord, digest, md);
            }
            // keeper objects on mountpath 0 as well
            let (digest, md) = entry(&keeper, &format!("x{i}"));
            cache.store(0, digest, md);
        }

        let evicted = cache.evict_bucket(&victim);
        assert_eq!(evicted, 64);
        assert_eq!(cache.len(), 128);
        let (digest, md) = entry(&victim, "o0");
        assert!(cache.lookup(0, digest, &md.uname).is_none());
    }

    #[test]
    fn test_evict_bucket_name_prefix_is_exact() {
        // bucket "b" must not evict bucket "bb"
        let cache = LomCache::new(1);
        let (digest, md) = entry(&Bck::local("bb"), "o");
        cache.store(0, digest, Arc::clone(&md));
        cache.evict_bucket(&Bck::local("b"));
        assert!(cache.lookup(0, digest, &md.uname).is_some());
    }
}
