//! Tessera target core
//!
//! Local Object Metadata (LOM) and its supporting machinery on a storage
//! target: the per-mountpath sharded metadata cache, the memory-pressure
//! driven cache eviction runner, the bucket-metadata snapshot, and the
//! collaborator traits connecting the core to the health checker and the
//! space manager.

pub mod bmd;
pub mod cache;
pub mod ctx;
pub mod hooks;
pub mod lom;
pub mod runner;

pub use bmd::{Bmd, BmdOwner, BucketProps, LruConf, MirrorConf};
pub use cache::{LomCache, LOM_CACHE_STRIPES};
pub use ctx::Tctx;
pub use hooks::{MemPressure, MemPressureSource, NopHooks, ProcMeminfo, TargetHooks};
pub use lom::{Lmeta, Lom};
pub use runner::LomCacheRunner;
