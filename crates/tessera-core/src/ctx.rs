//! Target runtime context
//!
//! One bundle of everything LOM operations need: configuration, the
//! mountpath registry, the metadata cache, the bucket-metadata owner, and
//! the collaborator hooks. Handles clone the `Arc`, never the contents.
//!
//! Hooks are late-bound: collaborators like the space manager need the
//! context to exist before they can register themselves, so the slot is
//! rotated atomically after construction via [`Tctx::set_hooks`].

use std::sync::Arc;

use parking_lot::RwLock;

use tessera_common::{BufferPool, Config, Result};
use tessera_fs::MountpathRegistry;

use crate::bmd::BmdOwner;
use crate::cache::LomCache;
use crate::hooks::TargetHooks;

pub struct Tctx {
    pub config: Arc<Config>,
    pub mountpaths: Arc<MountpathRegistry>,
    pub lcache: LomCache,
    pub bowner: BmdOwner,
    hooks: RwLock<Arc<dyn TargetHooks>>,
    pub pool: BufferPool,
}

impl std::fmt::Debug for Tctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tctx").finish_non_exhaustive()
    }
}

impl Tctx {
    /// Validate configuration, enumerate mountpaths, and size the cache.
    /// Both failures here are fatal at startup.
    pub fn new(config: Arc<Config>, hooks: Arc<dyn TargetHooks>) -> Result<Arc<Self>> {
        config.validate()?;
        let mountpaths = Arc::new(MountpathRegistry::new(&config.mountpaths)?);
        let lcache = LomCache::new(mountpaths.len());
        Ok(Arc::new(Self {
            config,
            mountpaths,
            lcache,
            bowner: BmdOwner::default(),
            hooks: RwLock::new(hooks),
            pool: BufferPool::default(),
        }))
    }

    /// The current collaborator hooks
    #[must_use]
    pub fn hooks(&self) -> Arc<dyn TargetHooks> {
        Arc::clone(&self.hooks.read())
    }

    /// Install collaborator hooks after construction
    pub fn set_hooks(&self, hooks: Arc<dyn TargetHooks>) {
        *self.hooks.write() = hooks;
    }
}
