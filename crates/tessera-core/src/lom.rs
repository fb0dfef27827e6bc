//! Local Object Metadata (LOM)
//!
//! An LOM is a short-lived handle over the locally stored object named by
//! `(bucket, object)`: size, version, access time, checksum, and the
//! replica set, backed by the xattr record and `stat` of the file at the
//! object's FQN. The filesystem is the source of truth; the per-mountpath
//! cache holds decoded records between accesses.
//!
//! Lifecycle of a handle:
//!
//! 1. construct and initialize: [`Lom::init`] / [`Lom::from_fqn`]
//! 2. load persistent state from cache or disk: [`Lom::load`]
//! 3. use accessors; mutate via `set_*`
//! 4. write through: [`Lom::persist`], then [`Lom::recache`]
//! 5. drop from cache when deleting the object: [`Lom::uncache`]

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tracing::{error, warn};

use tessera_common::checksum::compute_file_checksum;
use tessera_common::config::CksumConf;
use tessera_common::{
    make_uname, parse_uname, Bck, Checksum, ChecksumType, Error, Result,
};
use tessera_fs::{meta::BlobMeta, xattrs, ContentType, Mountpath, ParsedFqn};

use crate::bmd::{Bmd, BucketProps};
use crate::ctx::Tctx;

/// The persistent part of an LOM; what the cache holds and the xattr
/// record serializes
#[derive(Clone, Debug, Default)]
pub struct Lmeta {
    pub uname: String,
    pub size: i64,
    pub version: Option<String>,
    /// ns since epoch
    pub atime: i64,
    /// the atime last persisted to the filesystem
    pub atime_fs: i64,
    /// generation of the containing bucket
    pub bck_id: u64,
    pub cksum: Option<Checksum>,
    /// replica FQNs on other mountpaths
    pub copies: HashMap<PathBuf, Arc<Mountpath>>,
}

/// A handle over one locally stored object
pub struct Lom {
    ctx: Arc<Tctx>,
    md: Lmeta,
    pub bck: Bck,
    pub objname: String,
    /// where this replica resides
    pub fqn: PathBuf,
    /// where the primary would reside under rendezvous placement
    pub hrw_fqn: PathBuf,
    pub parsed: ParsedFqn,
    props: BucketProps,
    bmd: Arc<Bmd>,
    pub bad_cksum: bool,
    exists: bool,
    loaded: bool,
}

impl std::fmt::Debug for Lom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lom")
            .field("bck", &self.bck)
            .field("objname", &self.objname)
            .field("fqn", &self.fqn)
            .finish_non_exhaustive()
    }
}

impl Lom {
    /// Construct and initialize a handle from `(bucket, object)`: resolve
    /// bucket props, the HRW mountpath, and the primary FQN.
    ///
    /// Fails with `bucket-not-found` when the bucket is local and absent.
    pub fn init(ctx: &Arc<Tctx>, bck: Bck, objname: &str) -> Result<Self> {
        let bmd = ctx.bowner.get();
        let props = Self::resolve_props(ctx, &bmd, &bck)?;
        let (mpath, fqn, digest) = ctx.mountpaths.hrw_fqn(&bck, objname)?;
        let parsed = ParsedFqn {
            mpath,
            content_type: ContentType::Object,
            bck: bck.clone(),
            objname: objname.to_owned(),
            digest,
        };
        Ok(Self {
            ctx: Arc::clone(ctx),
            md: Lmeta {
                uname: make_uname(&bck, objname),
                ..Default::default()
            },
            bck,
            objname: objname.to_owned(),
            fqn: fqn.clone(),
            hrw_fqn: fqn,
            parsed,
            props,
            bmd,
            bad_cksum: false,
            exists: false,
            loaded: false,
        })
    }

    /// Construct a handle from an existing FQN (replica or primary)
    pub fn from_fqn(ctx: &Arc<Tctx>, fqn: &Path) -> Result<Self> {
        let parsed = ctx.mountpaths.parse_fqn(fqn)?;
        if parsed.content_type != ContentType::Object {
            return Err(Error::InvalidFqn(fqn.to_path_buf()));
        }
        let bmd = ctx.bowner.get();
        let props = Self::resolve_props(ctx, &bmd, &parsed.bck)?;
        let hrw_mpath = ctx.mountpaths.hrw(parsed.digest)?;
        let hrw_fqn = hrw_mpath.fqn(&parsed.bck, ContentType::Object, &parsed.objname);
        Ok(Self {
            ctx: Arc::clone(ctx),
            md: Lmeta {
                uname: make_uname(&parsed.bck, &parsed.objname),
                ..Default::default()
            },
            bck: parsed.bck.clone(),
            objname: parsed.objname.clone(),
            fqn: fqn.to_path_buf(),
            hrw_fqn,
            parsed,
            props,
            bmd,
            bad_cksum: false,
            exists: false,
            loaded: false,
        })
    }

    fn resolve_props(ctx: &Tctx, bmd: &Bmd, bck: &Bck) -> Result<BucketProps> {
        match bmd.props(bck) {
            Some(p) => Ok(p.clone()),
            None if bck.is_local() => Err(Error::BucketNotFound(bck.name.clone())),
            // remote buckets are discovered lazily; defaults apply
            None => Ok(BucketProps::with_defaults(&ctx.config, 0)),
        }
    }

    //
    // accessors
    //

    #[must_use]
    pub fn uname(&self) -> &str {
        &self.md.uname
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.md.size
    }

    pub fn set_size(&mut self, size: i64) {
        self.md.size = size;
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.md.version.as_deref()
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.md.version = Some(version.into());
    }

    #[must_use]
    pub fn cksum(&self) -> Option<&Checksum> {
        self.md.cksum.as_ref()
    }

    pub fn set_cksum(&mut self, cksum: Checksum) {
        self.md.cksum = Some(cksum);
    }

    /// ns since epoch
    #[must_use]
    pub fn atime(&self) -> i64 {
        self.md.atime
    }

    pub fn set_atime(&mut self, atime_ns: i64) {
        self.md.atime = atime_ns;
    }

    #[must_use]
    pub fn bucket_props(&self) -> &BucketProps {
        &self.props
    }

    #[must_use]
    pub fn cksum_conf(&self) -> &CksumConf {
        &self.props.cksum
    }

    #[must_use]
    pub fn lru_enabled(&self) -> bool {
        self.props.lru.enabled
    }

    #[must_use]
    pub fn versioning_enabled(&self) -> bool {
        self.props.versioning.enabled
    }

    /// In place at its rendezvous location?
    #[must_use]
    pub fn in_place(&self) -> bool {
        self.fqn == self.hrw_fqn
    }

    /// Misplaced (subject to rebalance); copies are not misplaced
    #[must_use]
    pub fn misplaced(&self) -> bool {
        !self.in_place() && !self.is_copy()
    }

    //
    // replica set
    //

    #[must_use]
    pub fn num_copies(&self) -> usize {
        self.md.copies.len() + 1
    }

    /// This handle points at a copy iff its single copy entry points back
    /// at the rendezvous location
    #[must_use]
    pub fn is_copy(&self) -> bool {
        self.md.copies.len() == 1 && self.md.copies.contains_key(&self.hrw_fqn)
    }

    #[must_use]
    pub fn has_copies(&self) -> bool {
        !self.is_copy() && self.num_copies() > 1
    }

    #[must_use]
    pub fn copies(&self) -> &HashMap<PathBuf, Arc<Mountpath>> {
        &self.md.copies
    }

    /// Record a replica. The handle's own FQN never appears in its copy
    /// set; a duplicate registration is a conflict.
    pub fn add_copy(&mut self, copy_fqn: &Path, mpath: &Arc<Mountpath>) -> Result<()> {
        if copy_fqn == self.fqn {
            return Err(self.whinge(format!(
                "{self}: own FQN registered as its copy ({})",
                copy_fqn.display()
            )));
        }
        if self.md.copies.contains_key(copy_fqn) {
            return Err(self.whinge(format!("{self}: duplicate copy {}", copy_fqn.display())));
        }
        self.md
            .copies
            .insert(copy_fqn.to_path_buf(), Arc::clone(mpath));
        Ok(())
    }

    /// Drop one replica, removing its file; deleting the last one is
    /// equivalent to [`Lom::del_all_copies`]
    pub fn del_copy(&mut self, copy_fqn: &Path) -> Result<()> {
        if !self.md.copies.contains_key(copy_fqn) {
            return Err(self.whinge(format!(
                "{self}: copy {} does not exist",
                copy_fqn.display()
            )));
        }
        if self.md.copies.len() == 1 {
            return self.del_all_copies();
        }
        self.whinge_copy()?;
        self.md.copies.remove(copy_fqn);
        remove_file_tolerant(copy_fqn)?;
        Ok(())
    }

    /// Drop all replicas and their files
    pub fn del_all_copies(&mut self) -> Result<()> {
        self.whinge_copy()?;
        if self.md.copies.is_empty() {
            return Ok(());
        }
        let mut first_err = None;
        self.md.copies.retain(|fqn, _| {
            match remove_file_tolerant(fqn) {
                Ok(()) => false,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    true
                }
            }
        });
        match first_err {
            None => Ok(()),
            Some(e) => {
                error!("{self}: failed to remove some copies: {e}");
                Err(e)
            }
        }
    }

    // copy-management ops on a copy handle are a programmer error
    fn whinge_copy(&self) -> Result<()> {
        if self.is_copy() {
            return Err(self.whinge(format!(
                "{self}: copy management via a copy handle (hrw={})",
                self.hrw_fqn.display()
            )));
        }
        Ok(())
    }

    fn whinge(&self, msg: String) -> Error {
        debug_assert!(false, "{msg}");
        error!("{msg}");
        Error::Conflict(msg)
    }

    /// Copy the object's bytes to `dst_fqn`, returning a handle over the
    /// destination. Fails with `source-is-copy` on a copy handle.
    pub fn copy_object(&self, dst_fqn: &Path) -> Result<Lom> {
        if self.is_copy() {
            return Err(Error::SourceIsCopy(self.fqn.clone()));
        }
        let ctx = Arc::clone(&self.ctx);
        if let Some(parent) = dst_fqn.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::unavailable(dst_fqn, e))?;
        }
        let mut src = File::open(&self.fqn).map_err(|e| Error::unavailable(&self.fqn, e))?;
        let mut dst = File::create(dst_fqn).map_err(|e| Error::unavailable(dst_fqn, e))?;
        let mut buf = ctx.pool.get();
        loop {
            let n = src
                .read(&mut buf)
                .map_err(|e| Error::unavailable(&self.fqn, e))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])
                .map_err(|e| Error::unavailable(dst_fqn, e))?;
        }
        ctx.pool.put(buf);
        self.clone_to(dst_fqn)
    }

    /// Clone the handle onto another FQN of the same object
    pub fn clone_to(&self, fqn: &Path) -> Result<Lom> {
        let parsed = self.ctx.mountpaths.parse_fqn(fqn)?;
        Ok(Lom {
            ctx: Arc::clone(&self.ctx),
            md: self.md.clone(),
            bck: self.bck.clone(),
            objname: self.objname.clone(),
            fqn: fqn.to_path_buf(),
            hrw_fqn: self.hrw_fqn.clone(),
            parsed,
            props: self.props.clone(),
            bmd: Arc::clone(&self.bmd),
            bad_cksum: self.bad_cksum,
            exists: self.exists,
            loaded: self.loaded,
        })
    }

    //
    // load / persist / cache
    //

    /// Load persistent state, preferring the cache when the handle is at
    /// its rendezvous location. Returns whether the cache served it.
    ///
    /// With `add_to_cache == false` a cache hit is also removed - useful
    /// right before deleting the object.
    pub fn load(&mut self, add_to_cache: bool) -> Result<bool> {
        let ctx = Arc::clone(&self.ctx);
        self.loaded = true;
        let in_place = self.in_place();

        // fast path
        if in_place {
            let (ord, digest) = (self.parsed.mpath.ord, self.parsed.digest);
            if let Some(md) = ctx.lcache.lookup(ord, digest, &self.md.uname) {
                self.md = (*md).clone();
                self.exists = true;
                if !add_to_cache {
                    ctx.lcache.remove(ord, digest, &self.md.uname);
                }
                if self.exists_in_bucket() {
                    return Ok(true);
                }
                // stale bucket generation: entry evicted, fall through
            }
        }

        // slow path: xattr record + stat
        self.from_fs()?;
        if self.exists {
            self.md.bck_id = self.props.bid;
            if add_to_cache && in_place {
                ctx.lcache.store(
                    self.parsed.mpath.ord,
                    self.parsed.digest,
                    Arc::new(self.md.clone()),
                );
            }
        }
        Ok(false)
    }

    /// Whether the object exists; a stale bucket generation evicts the
    /// entry and reads as absent. Requires a prior [`Lom::load`].
    pub fn exists(&mut self) -> bool {
        debug_assert!(self.loaded, "exists() before load()");
        self.exists_in_bucket()
    }

    fn exists_in_bucket(&mut self) -> bool {
        if self.bck.is_local() && self.exists && !self.bmd.exists(&self.bck, self.md.bck_id) {
            if self.in_place() {
                self.uncache();
            }
            self.exists = false;
            return false;
        }
        self.exists
    }

    /// Read the metadata record and stat the file, bypassing the cache.
    ///
    /// A missing file is not an error (`exists` turns false). A file with
    /// no metadata record is benign: size and atime come from `stat`. Any
    /// other mountpath error escalates to the health checker.
    pub fn from_fs(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        self.exists = true;

        let have_blob = match xattrs::get_blob(&self.fqn) {
            Ok(blob) => {
                let meta = BlobMeta::decode(&blob, &self.fqn)?;
                self.apply_blob(meta);
                true
            }
            Err(Error::ObjectNotFound(_)) => {
                self.exists = false;
                return Ok(());
            }
            Err(Error::NoMetadata(_)) => false,
            Err(err) => {
                self.exists = false;
                ctx.hooks().fshc(&err, &self.fqn);
                return Err(err);
            }
        };

        let finfo = match std::fs::metadata(&self.fqn) {
            Ok(finfo) => finfo,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.exists = false;
                return Ok(());
            }
            Err(e) => {
                self.exists = false;
                let err = Error::unavailable(&self.fqn, e);
                ctx.hooks().fshc(&err, &self.fqn);
                return Err(err);
            }
        };

        let fs_size = finfo.len() as i64;
        if have_blob && self.md.size != fs_size {
            // corruption or tampering
            return Err(Error::SizeMismatch {
                fqn: self.fqn.clone(),
                meta: self.md.size,
                fs: fs_size,
            });
        }
        self.md.size = fs_size;
        let atime = atime_ns(&finfo);
        self.md.atime = atime;
        self.md.atime_fs = atime;
        Ok(())
    }

    fn apply_blob(&mut self, meta: BlobMeta) {
        let ctx = Arc::clone(&self.ctx);
        self.md.size = meta.size;
        self.md.version = meta.version;
        self.md.cksum = meta.cksum;
        self.md.copies.clear();
        for copy in meta.copies {
            let fqn = PathBuf::from(copy);
            match ctx.mountpaths.lookup(&fqn) {
                Some(mpath) => {
                    let mpath = Arc::clone(mpath);
                    self.md.copies.insert(fqn, mpath);
                }
                // replica on a detached mountpath; unusable until reattach
                None => warn!("{self}: dropping copy {} (no mountpath)", fqn.display()),
            }
        }
    }

    /// Write the metadata record to the object's xattr
    pub fn persist(&self) -> Result<()> {
        let blob = self.to_blob().encode();
        xattrs::set_blob(&self.fqn, &blob)
    }

    fn to_blob(&self) -> BlobMeta {
        BlobMeta {
            size: self.md.size,
            version: self.md.version.clone(),
            atime: self.md.atime,
            cksum: self.md.cksum.clone(),
            copies: self
                .md
                .copies
                .keys()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        }
    }

    /// (Re)install this handle's metadata in the cache. Only primaries at
    /// their rendezvous location are cached.
    pub fn recache(&mut self) {
        if !self.assert_in_place("recache") {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        self.md.bck_id = self.props.bid;
        ctx.lcache.store(
            self.parsed.mpath.ord,
            self.parsed.digest,
            Arc::new(self.md.clone()),
        );
        self.loaded = true;
    }

    /// Drop this object's entry from the cache
    pub fn uncache(&self) {
        if !self.assert_in_place("uncache") {
            return;
        }
        self.ctx
            .lcache
            .remove(self.parsed.mpath.ord, self.parsed.digest, &self.md.uname);
    }

    fn assert_in_place(&self, op: &str) -> bool {
        if !self.in_place() {
            debug_assert!(false, "{op} of a non-hrw FQN {}", self.fqn.display());
            error!("{self}: {op} of a non-hrw FQN");
            return false;
        }
        true
    }

    //
    // checksums
    //

    /// Validate the object's checksum per the bucket configuration.
    ///
    /// The cached and xattr checksums must agree; disagreement marks the
    /// object bad and evicts it. With a stored value present and
    /// `recompute == false` that cross-check is all. Otherwise the content
    /// checksum is recomputed over the full file; a first-time compute is
    /// stored and re-cached rather than compared.
    pub fn validate_checksum(&mut self, recompute: bool) -> Result<()> {
        if self.cksum_conf().ty == ChecksumType::None {
            return Ok(());
        }
        let cached = self.md.cksum.clone();
        let stored = match xattrs::get_blob(&self.fqn) {
            Ok(blob) => BlobMeta::decode(&blob, &self.fqn)?.cksum,
            Err(Error::NoMetadata(_)) => None,
            Err(err) => return Err(err),
        };

        if !recompute && cached.is_none() && stored.is_none() {
            return Ok(()); // nothing to validate against
        }
        // both missing and recompute requested: go straight to computing
        let recompute_empty = recompute && cached.is_none() && stored.is_none();
        if !recompute_empty && stored != cached {
            self.bad_cksum = true;
            self.uncache();
            return Err(Error::BadChecksum {
                fqn: self.fqn.clone(),
                stored: fmt_cksum(&stored),
                computed: fmt_cksum(&cached),
            });
        }
        if cached.is_some() && !recompute {
            return Ok(());
        }
        self.validate_disk_checksum()
    }

    /// Compare the metadata checksum against the file contents, assuming
    /// the metadata and xattr values are already known to agree. Computes
    /// and persists a missing value.
    pub fn validate_disk_checksum(&mut self) -> Result<()> {
        let conf_ty = self.cksum_conf().ty;
        if conf_ty == ChecksumType::None {
            return Ok(());
        }
        // old objects keep their stored algorithm across bucket reconfigs
        let ty = self.md.cksum.as_ref().map_or(conf_ty, |c| c.ty);
        let computed = compute_file_checksum(&self.fqn, ty, &self.ctx.pool)?;

        match self.md.cksum.take() {
            None => {
                self.md.cksum = Some(computed);
                if let Err(e) = self.persist() {
                    self.md.cksum = None;
                    return Err(e);
                }
                self.recache();
                Ok(())
            }
            Some(stored) if stored == computed => {
                self.md.cksum = Some(stored);
                Ok(())
            }
            Some(stored) => {
                self.md.cksum = Some(stored.clone());
                self.bad_cksum = true;
                self.uncache();
                Err(Error::BadChecksum {
                    fqn: self.fqn.clone(),
                    stored: stored.value,
                    computed: computed.value,
                })
            }
        }
    }

    /// The stored checksum, or a freshly computed one; does not persist
    pub fn cksum_compute_if_missing(&self) -> Result<Option<Checksum>> {
        let ty = self.cksum_conf().ty;
        if ty == ChecksumType::None {
            return Ok(None);
        }
        if let Some(cksum) = &self.md.cksum {
            return Ok(Some(cksum.clone()));
        }
        compute_file_checksum(&self.fqn, ty, &self.ctx.pool).map(Some)
    }

    //
    // versioning
    //

    /// Next object version: the stored decimal version incremented, `"1"`
    /// for a new or unversioned object. A non-numeric stored version is
    /// an error.
    pub fn inc_object_version(&self) -> Result<String> {
        const INITIAL_VERSION: &str = "1";
        if !self.exists {
            return Ok(INITIAL_VERSION.to_owned());
        }
        let stored = match xattrs::get_blob(&self.fqn) {
            Ok(blob) => BlobMeta::decode(&blob, &self.fqn)?.version,
            Err(Error::NoMetadata(_) | Error::ObjectNotFound(_)) => None,
            Err(err) => return Err(err),
        };
        match stored {
            None => Ok(INITIAL_VERSION.to_owned()),
            Some(v) => match v.parse::<i64>() {
                Ok(n) => Ok((n + 1).to_string()),
                Err(_) => Err(Error::NonNumericVersion(v)),
            },
        }
    }

    //
    // GET load balancing and atime write-back
    //

    /// Best-effort: the replica on the least utilized mountpath right
    /// now. Reads the utilization cells without locks; tearing tolerated.
    #[must_use]
    pub fn load_balance_get(&self) -> PathBuf {
        if self.md.copies.is_empty() {
            return self.fqn.clone();
        }
        let mut best: (&PathBuf, i64) = (&self.fqn, self.parsed.mpath.util());
        for (fqn, mpath) in &self.md.copies {
            let util = mpath.util();
            if util < best.1 {
                best = (fqn, util);
            }
        }
        best.0.clone()
    }

    /// Write the in-memory atime through to the filesystem, preserving
    /// mtime; best-effort
    pub fn flush_atime(&self) {
        let Ok(finfo) = std::fs::metadata(&self.fqn) else {
            return;
        };
        let mtime = FileTime::from_last_modification_time(&finfo);
        let atime = FileTime::from_unix_time(
            self.md.atime.div_euclid(1_000_000_000),
            self.md.atime.rem_euclid(1_000_000_000) as u32,
        );
        if let Err(e) = filetime::set_file_times(&self.fqn, atime, mtime) {
            warn!("{self}: atime flush failed: {e}");
        }
    }

    /// Reconstruct a primary handle from a cached record; used by the
    /// cache runner for atime write-back on eviction
    pub(crate) fn from_lmeta(ctx: &Arc<Tctx>, md: &Lmeta) -> Result<Self> {
        let (bck, objname) = parse_uname(&md.uname)?;
        let bmd = ctx.bowner.get();
        if bck.is_local() && !bmd.exists(&bck, md.bck_id) {
            return Err(Error::BucketNotFound(bck.name));
        }
        let mut lom = Self::init(ctx, bck, objname)?;
        lom.md = md.clone();
        lom.loaded = true;
        lom.exists = true;
        Ok(lom)
    }

    /// The lmeta snapshot, cloning; test and runner use only
    #[must_use]
    pub fn lmeta(&self) -> Lmeta {
        self.md.clone()
    }
}

impl fmt::Display for Lom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o[{}/{}", self.bck, self.objname)?;
        if !self.loaded {
            write!(f, "(-)")?;
        } else if !self.exists {
            write!(f, "(x)")?;
        } else {
            if self.misplaced() {
                write!(f, "(misplaced)")?;
            }
            if self.is_copy() {
                write!(f, "(copy)")?;
            }
            let n = self.num_copies();
            if n > 1 {
                write!(f, "({n}c)")?;
            }
            if self.bad_cksum {
                write!(f, "(bad-cksum)")?;
            }
        }
        write!(f, "]")
    }
}

fn fmt_cksum(cksum: &Option<Checksum>) -> String {
    match cksum {
        Some(c) => c.to_string(),
        None => "-".to_owned(),
    }
}

fn remove_file_tolerant(fqn: &Path) -> Result<()> {
    match std::fs::remove_file(fqn) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::unavailable(fqn, e)),
    }
}

#[cfg(unix)]
fn atime_ns(finfo: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    finfo.atime() * 1_000_000_000 + finfo.atime_nsec()
}

#[cfg(not(unix))]
fn atime_ns(finfo: &std::fs::Metadata) -> i64 {
    finfo
        .accessed()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as i64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hooks::NopHooks;
    use tessera_common::Config;
    use tempfile::TempDir;

    pub(crate) fn test_ctx(n_mpaths: usize) -> (Vec<TempDir>, Arc<Tctx>) {
        let dirs: Vec<_> = (0..n_mpaths).map(|_| TempDir::new().unwrap()).collect();
        let mut config = Config::default();
        config.mountpaths = dirs.iter().map(|d| d.path().to_path_buf()).collect();
        let ctx = Tctx::new(Arc::new(config), Arc::new(NopHooks)).unwrap();

        let mut bmd = Bmd::default();
        bmd.version = 1;
        bmd.add(
            Bck::local("b1"),
            BucketProps::with_defaults(&ctx.config, 1),
        );
        ctx.bowner.put(bmd);
        (dirs, ctx)
    }

    pub(crate) fn put_object(ctx: &Arc<Tctx>, bck: &Bck, objname: &str, data: &[u8]) -> Lom {
        let mut lom = Lom::init(ctx, bck.clone(), objname).unwrap();
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, data).unwrap();
        lom.from_fs().unwrap();
        lom.persist().unwrap();
        lom.recache();
        lom
    }

    pub(crate) fn xattrs_supported(ctx: &Arc<Tctx>) -> bool {
        let probe = ctx.mountpaths.get(0).unwrap().path.join(".probe");
        std::fs::write(&probe, b"x").unwrap();
        let ok = xattrs::set_blob(&probe, b"1").is_ok();
        let _ = std::fs::remove_file(&probe);
        ok
    }

    #[test]
    fn test_init_requires_local_bucket() {
        let (_dirs, ctx) = test_ctx(2);
        let err = Lom::init(&ctx, Bck::local("nope"), "o").unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));

        // remote buckets come up with defaults
        let lom = Lom::init(&ctx, Bck::new("remote", tessera_common::Provider::Cloud), "o");
        assert!(lom.is_ok());
    }

    #[test]
    fn test_init_is_in_place_by_construction() {
        let (_dirs, ctx) = test_ctx(4);
        let lom = Lom::init(&ctx, Bck::local("b1"), "dir/o1").unwrap();
        assert!(lom.in_place());
        assert!(!lom.misplaced());
        assert_eq!(lom.uname(), "local/b1/dir/o1");
    }

    #[test]
    fn test_put_then_get_and_vanish() {
        // put, load from cache, delete behind our back; a later
        // load(false) observes absence without error
        let (_dirs, ctx) = test_ctx(2);
        if !xattrs_supported(&ctx) {
            return;
        }
        let bck = Bck::local("b1");
        put_object(&ctx, &bck, "k", &vec![7u8; 4096]);

        let mut lom = Lom::init(&ctx, bck.clone(), "k").unwrap();
        let from_cache = lom.load(true).unwrap();
        assert!(from_cache);
        assert!(lom.exists());
        assert_eq!(lom.size(), 4096);

        std::fs::remove_file(&lom.fqn).unwrap();

        let mut lom2 = Lom::init(&ctx, bck, "k").unwrap();
        let from_cache = lom2.load(false).unwrap(); // also drops the entry
        assert!(from_cache); // served from cache before the stat happens
        let mut lom3 = Lom::init(&ctx, Bck::local("b1"), "k").unwrap();
        lom3.load(false).unwrap();
        assert!(!lom3.exists());
        assert!(ctx.lcache.is_empty());
    }

    #[test]
    fn test_roundtrip_metadata_survives_cache_drop() {
        let (_dirs, ctx) = test_ctx(2);
        if !xattrs_supported(&ctx) {
            return;
        }
        let bck = Bck::local("b1");
        let mut lom = put_object(&ctx, &bck, "o", b"0123456789");
        lom.set_version("7");
        lom.set_cksum(Checksum::new(ChecksumType::XxHash64, "aabb"));
        lom.persist().unwrap();
        lom.uncache();

        let mut back = Lom::init(&ctx, bck, "o").unwrap();
        let from_cache = back.load(true).unwrap();
        assert!(!from_cache);
        assert_eq!(back.version(), Some("7"));
        assert_eq!(back.size(), 10);
        assert_eq!(
            back.cksum().unwrap(),
            &Checksum::new(ChecksumType::XxHash64, "aabb")
        );
    }

    #[test]
    fn test_size_invariant_detects_tampering() {
        let (_dirs, ctx) = test_ctx(1);
        if !xattrs_supported(&ctx) {
            return;
        }
        let bck = Bck::local("b1");
        let lom = put_object(&ctx, &bck, "o", b"full content");
        lom.uncache();

        // truncate behind the metadata's back
        std::fs::write(&lom.fqn, b"short").unwrap();

        let mut back = Lom::init(&ctx, bck, "o").unwrap();
        let err = back.load(true).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(err.http_status_code(), 500);
    }

    #[test]
    fn test_no_metadata_is_benign() {
        let (_dirs, ctx) = test_ctx(1);
        let bck = Bck::local("b1");
        let mut lom = Lom::init(&ctx, bck, "bare").unwrap();
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, b"payload").unwrap();

        lom.load(true).unwrap();
        assert!(lom.exists());
        assert_eq!(lom.size(), 7);
        assert!(lom.version().is_none());
        assert!(lom.cksum().is_none());
    }

    #[test]
    fn test_stale_bucket_id_evicts() {
        let (_dirs, ctx) = test_ctx(1);
        if !xattrs_supported(&ctx) {
            return;
        }
        let bck = Bck::local("b1");
        put_object(&ctx, &bck, "o", b"v1");
        assert_eq!(ctx.lcache.len(), 1);

        // bump the bucket generation
        let mut bmd = Bmd::default();
        bmd.version = 2;
        bmd.add(bck.clone(), BucketProps::with_defaults(&ctx.config, 2));
        ctx.bowner.put(bmd);

        let mut lom = Lom::init(&ctx, bck, "o").unwrap();
        let from_cache = lom.load(true).unwrap();
        assert!(!from_cache, "stale generation must not serve from cache");
        assert!(lom.exists());
        assert_eq!(lom.lmeta().bck_id, 2);
    }

    #[test]
    fn test_cache_only_at_hrw() {
        let (_dirs, ctx) = test_ctx(4);
        let bck = Bck::local("b1");
        let lom = Lom::init(&ctx, bck.clone(), "o").unwrap();

        // a replica on any other mountpath is never cached
        let other = ctx
            .mountpaths
            .iter()
            .find(|mp| mp.ord != lom.parsed.mpath.ord)
            .unwrap();
        let copy_fqn = other.fqn(&bck, ContentType::Object, "o");
        std::fs::create_dir_all(copy_fqn.parent().unwrap()).unwrap();
        std::fs::write(&copy_fqn, b"data").unwrap();

        let mut copy = Lom::from_fqn(&ctx, &copy_fqn).unwrap();
        assert!(!copy.in_place());
        copy.load(true).unwrap();
        assert!(copy.exists());
        assert!(ctx.lcache.is_empty(), "non-hrw FQNs must not be cached");
    }

    #[test]
    fn test_version_increment() {
        let (_dirs, ctx) = test_ctx(1);
        if !xattrs_supported(&ctx) {
            return;
        }
        let bck = Bck::local("b1");

        // stored "7" -> "8"
        let mut lom = put_object(&ctx, &bck, "o", b"x");
        lom.set_version("7");
        lom.persist().unwrap();
        assert_eq!(lom.inc_object_version().unwrap(), "8");

        // no stored version -> "1"
        let fresh = Lom::init(&ctx, bck.clone(), "new").unwrap();
        assert_eq!(fresh.inc_object_version().unwrap(), "1");

        // non-numeric -> error
        lom.set_version("v7");
        lom.persist().unwrap();
        assert!(matches!(
            lom.inc_object_version().unwrap_err(),
            Error::NonNumericVersion(_)
        ));
    }

    #[test]
    fn test_validate_checksum_corruption() {
        // persist, corrupt one byte, recompute: cksum-mismatch + eviction
        let (_dirs, ctx) = test_ctx(1);
        if !xattrs_supported(&ctx) {
            return;
        }
        let bck = Bck::local("b1");
        let data = vec![0x5a; 1024];
        let mut lom = put_object(&ctx, &bck, "o", &data);

        // first validation computes and stores the checksum
        lom.validate_checksum(true).unwrap();
        assert!(lom.cksum().is_some());
        let stored = lom.cksum().unwrap().clone();

        // idempotence: a second run is a no-op
        lom.validate_checksum(true).unwrap();
        assert_eq!(lom.cksum().unwrap(), &stored);
        assert_eq!(ctx.lcache.len(), 1);

        // flip a byte in the middle
        let mut tampered = data.clone();
        tampered[512] ^= 0xff;
        std::fs::write(&lom.fqn, &tampered).unwrap();
        lom.persist().unwrap(); // keep the (now wrong) stored value

        let err = lom.validate_checksum(true).unwrap_err();
        assert!(matches!(err, Error::BadChecksum { .. }));
        assert!(lom.bad_cksum);
        assert!(ctx.lcache.is_empty(), "bad object must leave the cache");
    }

    #[test]
    fn test_validate_checksum_none_is_noop() {
        let (_dirs, ctx) = test_ctx(1);
        let bck = Bck::local("b1");
        let mut lom = Lom::init(&ctx, bck, "o").unwrap();
        lom.props.cksum.ty = ChecksumType::None;
        // no file, no record: still fine
        lom.validate_checksum(true).unwrap();
    }

    #[test]
    fn test_copies_and_load_balance() {
        let (_dirs, ctx) = test_ctx(3);
        let bck = Bck::local("b1");
        let mut lom = put_object(&ctx, &bck, "o", b"abc");

        let mut copy_fqns = Vec::new();
        for mpath in ctx.mountpaths.iter() {
            if mpath.ord == lom.parsed.mpath.ord {
                continue;
            }
            let copy_fqn = mpath.fqn(&bck, ContentType::Object, "o");
            lom.copy_object(&copy_fqn).unwrap();
            lom.add_copy(&copy_fqn, mpath).unwrap();
            copy_fqns.push(copy_fqn);
        }
        assert_eq!(lom.num_copies(), 3);
        assert!(lom.has_copies());
        assert!(!lom.is_copy());

        // primary busy, one copy idle: GET goes to the idle replica
        lom.parsed.mpath.set_util(90);
        let idle = &copy_fqns[0];
        let idle_mp = ctx.mountpaths.lookup(idle).unwrap();
        idle_mp.set_util(5);
        for mpath in ctx.mountpaths.iter() {
            if mpath.ord != lom.parsed.mpath.ord && mpath.ord != idle_mp.ord {
                mpath.set_util(50);
            }
        }
        assert_eq!(lom.load_balance_get(), *idle);

        // the copy handle knows what it is
        let copy = Lom::from_fqn(&ctx, &copy_fqns[0]).unwrap();
        let mut copy = copy;
        copy.add_copy(&lom.hrw_fqn.clone(), &lom.parsed.mpath.clone())
            .unwrap();
        assert!(copy.is_copy());
        assert!(matches!(
            copy.copy_object(&copy_fqns[1]).unwrap_err(),
            Error::SourceIsCopy(_)
        ));
    }

    #[test]
    fn test_del_copies() {
        let (_dirs, ctx) = test_ctx(3);
        let bck = Bck::local("b1");
        let mut lom = put_object(&ctx, &bck, "o", b"abc");

        let mut copy_fqns = Vec::new();
        for mpath in ctx.mountpaths.iter() {
            if mpath.ord == lom.parsed.mpath.ord {
                continue;
            }
            let copy_fqn = mpath.fqn(&bck, ContentType::Object, "o");
            lom.copy_object(&copy_fqn).unwrap();
            lom.add_copy(&copy_fqn, mpath).unwrap();
            copy_fqns.push(copy_fqn);
        }

        lom.del_copy(&copy_fqns[0]).unwrap();
        assert!(!copy_fqns[0].exists());
        assert_eq!(lom.num_copies(), 2);

        // deleting the last copy deletes all
        lom.del_copy(&copy_fqns[1]).unwrap();
        assert!(!copy_fqns[1].exists());
        assert_eq!(lom.num_copies(), 1);
        assert!(!lom.has_copies());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_del_missing_copy_is_conflict() {
        let (_dirs, ctx) = test_ctx(2);
        let bck = Bck::local("b1");
        let mut lom = put_object(&ctx, &bck, "o", b"abc");
        let err = lom.del_copy(Path::new("/not/registered")).unwrap_err();
        assert_eq!(err.http_status_code(), 409);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_own_fqn_never_a_copy() {
        let (_dirs, ctx) = test_ctx(2);
        let bck = Bck::local("b1");
        let mut lom = put_object(&ctx, &bck, "o", b"abc");
        let own = lom.fqn.clone();
        let mpath = lom.parsed.mpath.clone();
        assert!(lom.add_copy(&own, &mpath).is_err());
        assert_eq!(lom.num_copies(), 1);
    }

    #[test]
    fn test_display_states() {
        let (_dirs, ctx) = test_ctx(1);
        let bck = Bck::local("b1");
        let mut lom = Lom::init(&ctx, bck, "o").unwrap();
        assert_eq!(lom.to_string(), "o[local/b1/o(-)]");
        lom.load(false).unwrap();
        assert_eq!(lom.to_string(), "o[local/b1/o(x)]");
    }
}
