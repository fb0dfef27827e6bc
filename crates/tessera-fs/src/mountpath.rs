//! Mountpaths and fully-qualified names
//!
//! A mountpath is a local filesystem root owned by this target. An FQN is
//! the absolute path of one replica:
//!
//! ```text
//! <mountpath>/<provider>/<bucket>/<content-type>/<object-name>
//! ```
//!
//! Object names may contain `/` and are stored verbatim. The owning
//! mountpath for `(bucket, object)` is selected by rendezvous (HRW)
//! hashing over mountpath roots.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use xxhash_rust::xxh64::xxh64;

use tessera_common::{uname_digest, Bck, Error, Provider, Result};

/// Reserved content types under a bucket directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// Object replicas
    Object,
    /// Workfiles: partially written or temporary content
    Work,
    /// Erasure-coded slices and metafiles
    Ec,
}

impl ContentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Object => "obj",
            Self::Work => "work",
            Self::Ec => "ec",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "obj" => Some(Self::Object),
            "work" => Some(Self::Work),
            "ec" => Some(Self::Ec),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local filesystem root with a unique filesystem ID
pub struct Mountpath {
    pub path: PathBuf,
    /// Position within the registry; the LOM cache shards key off it
    pub ord: usize,
    /// st_dev of the root; used to deduplicate shared filesystems
    pub fs_id: u64,
    /// Block devices backing this mountpath (best-effort, Linux only)
    pub disks: Vec<String>,
    /// Recent utilization %, written by the stats ticker and read without
    /// locks by GET load balancing; torn values are tolerated
    util: AtomicI64,
}

impl Mountpath {
    /// Deterministic, total FQN construction
    #[must_use]
    pub fn fqn(&self, bck: &Bck, ct: ContentType, objname: &str) -> PathBuf {
        let mut p = self.path.join(bck.provider.as_str());
        p.push(&bck.name);
        p.push(ct.as_str());
        p.push(objname);
        p
    }

    /// Workfile name for `(bucket, object)`: the object FQN under the
    /// `work` content type with a process-unique suffix
    #[must_use]
    pub fn work_fqn(&self, bck: &Bck, objname: &str, tag: &str) -> PathBuf {
        let mut p = self.fqn(bck, ContentType::Work, objname);
        let mut name = p.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!(".{}.{}", tag, process::id()));
        p.set_file_name(name);
        p
    }

    pub fn set_util(&self, pct: i64) {
        self.util.store(pct, Ordering::Relaxed);
    }

    #[must_use]
    pub fn util(&self) -> i64 {
        self.util.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Mountpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mp[{}, fs={}]", self.path.display(), self.fs_id)
    }
}

/// A parsed FQN, back-pointing to its mountpath by registry lookup
#[derive(Clone, Debug)]
pub struct ParsedFqn {
    pub mpath: Arc<Mountpath>,
    pub content_type: ContentType,
    pub bck: Bck,
    pub objname: String,
    /// xxh64 digest of the uname; shard and HRW key
    pub digest: u64,
}

/// The set of mountpaths this target owns
pub struct MountpathRegistry {
    mpaths: Vec<Arc<Mountpath>>,
}

impl MountpathRegistry {
    /// Enumerate mountpaths. Failure to enumerate (an empty or unreadable
    /// set) is fatal at startup.
    pub fn new(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::config("no mountpaths configured"));
        }
        let mut mpaths = Vec::with_capacity(paths.len());
        for (ord, path) in paths.iter().enumerate() {
            let md = std::fs::metadata(path).map_err(|e| {
                Error::config(format!("mountpath {}: {e}", path.display()))
            })?;
            if !md.is_dir() {
                return Err(Error::config(format!(
                    "mountpath {} is not a directory",
                    path.display()
                )));
            }
            let fs_id = fs_dev(&md);
            let disks = resolve_disks(fs_id);
            mpaths.push(Arc::new(Mountpath {
                path: path.clone(),
                ord,
                fs_id,
                disks,
                util: AtomicI64::new(0),
            }));
        }
        Ok(Self { mpaths })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mpaths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mpaths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mountpath>> {
        self.mpaths.iter()
    }

    #[must_use]
    pub fn get(&self, ord: usize) -> Option<&Arc<Mountpath>> {
        self.mpaths.get(ord)
    }

    /// Rendezvous-hash the owning mountpath for a uname digest: maximize a
    /// 64-bit hash of the mountpath root seeded with the digest
    pub fn hrw(&self, digest: u64) -> Result<&Arc<Mountpath>> {
        self.mpaths
            .iter()
            .max_by_key(|mp| xxh64(mp.path.as_os_str().as_encoded_bytes(), digest))
            .ok_or_else(|| Error::config("no mountpaths configured"))
    }

    /// Convenience: HRW mountpath and object FQN for `(bucket, object)`
    pub fn hrw_fqn(&self, bck: &Bck, objname: &str) -> Result<(Arc<Mountpath>, PathBuf, u64)> {
        let digest = uname_digest(&tessera_common::make_uname(bck, objname));
        let mpath = Arc::clone(self.hrw(digest)?);
        let fqn = mpath.fqn(bck, ContentType::Object, objname);
        Ok((mpath, fqn, digest))
    }

    /// Find the mountpath a path resides under
    #[must_use]
    pub fn lookup(&self, path: &Path) -> Option<&Arc<Mountpath>> {
        self.mpaths
            .iter()
            .filter(|mp| path.starts_with(&mp.path))
            .max_by_key(|mp| mp.path.as_os_str().len())
    }

    /// Parse an FQN into its constituents; fails with `invalid-fqn` when
    /// the path is not under any mountpath or is malformed
    pub fn parse_fqn(&self, path: &Path) -> Result<ParsedFqn> {
        let invalid = || Error::InvalidFqn(path.to_path_buf());

        let mpath = self.lookup(path).ok_or_else(invalid)?;
        let rel = path.strip_prefix(&mpath.path).map_err(|_| invalid())?;

        let mut comps = rel.components();
        let provider: Provider = comp_str(comps.next(), path)?
            .parse()
            .map_err(|_| invalid())?;
        let bucket = comp_str(comps.next(), path)?.to_owned();
        let ct = ContentType::from_str(comp_str(comps.next(), path)?).ok_or_else(invalid)?;

        let objname = comps.as_path().to_str().ok_or_else(invalid)?.to_owned();
        if bucket.is_empty() || objname.is_empty() {
            return Err(invalid());
        }

        let bck = Bck::new(bucket, provider);
        let digest = uname_digest(&tessera_common::make_uname(&bck, &objname));
        Ok(ParsedFqn {
            mpath: Arc::clone(mpath),
            content_type: ct,
            bck,
            objname,
            digest,
        })
    }
}

fn comp_str<'a>(c: Option<Component<'a>>, path: &Path) -> Result<&'a str> {
    match c {
        Some(Component::Normal(s)) => s
            .to_str()
            .ok_or_else(|| Error::InvalidFqn(path.to_path_buf())),
        _ => Err(Error::InvalidFqn(path.to_path_buf())),
    }
}

#[cfg(unix)]
fn fs_dev(md: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.dev()
}

#[cfg(not(unix))]
fn fs_dev(_md: &std::fs::Metadata) -> u64 {
    0
}

/// Resolve the block device(s) behind a st_dev by matching major:minor
/// against /proc/diskstats
#[cfg(target_os = "linux")]
fn resolve_disks(dev: u64) -> Vec<String> {
    let (maj, min) = (libc::major(dev), libc::minor(dev));
    let Ok(content) = std::fs::read_to_string("/proc/diskstats") else {
        return Vec::new();
    };
    let mut disks = Vec::new();
    for line in content.lines() {
        let mut f = line.split_whitespace();
        let (Some(m), Some(n), Some(name)) = (f.next(), f.next(), f.next()) else {
            continue;
        };
        if m.parse::<u32>() == Ok(maj as u32) && n.parse::<u32>() == Ok(min as u32) {
            disks.push(name.to_owned());
        }
    }
    disks
}

#[cfg(not(target_os = "linux"))]
fn resolve_disks(_dev: u64) -> Vec<String> {
    Vec::new()
}
