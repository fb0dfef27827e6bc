//! Bucket metadata snapshot
//!
//! Bucket metadata is shared read-only: an external owner rotates the
//! whole table atomically (pointer swap), readers hold one `Arc` snapshot
//! for the duration of an operation. Every bucket carries a generation
//! counter (`bid`); cached object metadata stamped with an older bid is
//! stale and gets evicted on load.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use tessera_common::config::{CksumConf, VersioningConf};
use tessera_common::{Bck, Config};

/// LRU eligibility of a bucket's objects
#[derive(Clone, Copy, Debug)]
pub struct LruConf {
    pub enabled: bool,
}

impl Default for LruConf {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Local mirroring (n-way replication across mountpaths)
#[derive(Clone, Copy, Debug)]
pub struct MirrorConf {
    pub enabled: bool,
    pub copies: u32,
}

impl Default for MirrorConf {
    fn default() -> Self {
        Self {
            enabled: false,
            copies: 2,
        }
    }
}

/// Per-bucket properties; cluster defaults unless overridden
#[derive(Clone, Debug, Default)]
pub struct BucketProps {
    /// Bucket generation counter
    pub bid: u64,
    pub cksum: CksumConf,
    pub versioning: VersioningConf,
    pub lru: LruConf,
    pub mirror: MirrorConf,
}

impl BucketProps {
    /// Props inheriting the cluster-level defaults
    #[must_use]
    pub fn with_defaults(config: &Config, bid: u64) -> Self {
        Self {
            bid,
            cksum: config.checksum,
            versioning: config.versioning,
            lru: LruConf::default(),
            mirror: MirrorConf::default(),
        }
    }
}

/// One immutable generation of the bucket table
#[derive(Clone, Debug, Default)]
pub struct Bmd {
    pub version: u64,
    buckets: HashMap<Bck, BucketProps>,
}

impl Bmd {
    pub fn add(&mut self, bck: Bck, props: BucketProps) {
        self.buckets.insert(bck, props);
    }

    pub fn remove(&mut self, bck: &Bck) {
        self.buckets.remove(bck);
    }

    #[must_use]
    pub fn props(&self, bck: &Bck) -> Option<&BucketProps> {
        self.buckets.get(bck)
    }

    /// True iff the bucket is present at exactly this generation
    #[must_use]
    pub fn exists(&self, bck: &Bck, bid: u64) -> bool {
        self.props(bck).is_some_and(|p| p.bid == bid)
    }
}

/// Rotating holder of the current bucket-metadata snapshot
#[derive(Debug, Default)]
pub struct BmdOwner {
    inner: RwLock<Arc<Bmd>>,
}

impl BmdOwner {
    /// Current snapshot; stable for as long as the caller holds it
    #[must_use]
    pub fn get(&self) -> Arc<Bmd> {
        Arc::clone(&self.inner.read())
    }

    /// Install a new generation
    pub fn put(&self, bmd: Bmd) {
        *self.inner.write() = Arc::new(bmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bid_generation_check() {
        let config = Config::default();
        let mut bmd = Bmd::default();
        let bck = Bck::local("b1");
        bmd.add(bck.clone(), BucketProps::with_defaults(&config, 7));

        assert!(bmd.exists(&bck, 7));
        assert!(!bmd.exists(&bck, 6));
        assert!(!bmd.exists(&Bck::local("other"), 7));
    }

    #[test]
    fn test_owner_rotation_keeps_old_snapshot_alive() {
        let config = Config::default();
        let owner = BmdOwner::default();

        let mut gen1 = Bmd::default();
        gen1.version = 1;
        gen1.add(Bck::local("b"), BucketProps::with_defaults(&config, 1));
        owner.put(gen1);

        let held = owner.get();

        let mut gen2 = Bmd::default();
        gen2.version = 2;
        owner.put(gen2);

        // the held snapshot still sees the bucket; the fresh one does not
        assert!(held.exists(&Bck::local("b"), 1));
        assert!(!owner.get().exists(&Bck::local("b"), 1));
        assert_eq!(owner.get().version, 2);
    }
}
