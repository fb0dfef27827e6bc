//! Core identity types
//!
//! An object is named by `(bucket, object-name)` within a provider
//! namespace. The *unified name* (uname) `<provider>/<bucket>/<object>` is
//! the canonical hash key for caching and rendezvous placement; object
//! names may contain `/` and are stored verbatim.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::{Error, Result};

/// Bucket namespace provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Bucket owned by this cluster
    Local,
    /// Bucket backed by a remote cloud; metadata still locally authoritative
    Cloud,
}

impl Provider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }

    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(Error::config(format!("unknown bucket provider {other:?}"))),
        }
    }
}

/// A bucket reference: name + provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    pub provider: Provider,
}

impl Bck {
    #[must_use]
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }

    #[must_use]
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, Provider::Local)
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.provider.is_local()
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Canonical unified name of `(bucket, object)`
#[must_use]
pub fn make_uname(bck: &Bck, objname: &str) -> String {
    format!("{}/{}/{}", bck.provider, bck.name, objname)
}

/// Split a uname back into `(bck, objname)`; objnames may contain `/`
pub fn parse_uname(uname: &str) -> Result<(Bck, &str)> {
    let mut it = uname.splitn(3, '/');
    let (provider, bucket, objname) = match (it.next(), it.next(), it.next()) {
        (Some(p), Some(b), Some(o)) if !b.is_empty() && !o.is_empty() => (p, b, o),
        _ => return Err(Error::config(format!("malformed uname {uname:?}"))),
    };
    Ok((Bck::new(bucket, provider.parse()?), objname))
}

/// 64-bit digest of a uname; the shard and rendezvous-hash key
#[must_use]
pub fn uname_digest(uname: &str) -> u64 {
    xxh64(uname.as_bytes(), 0)
}

/// Node-state flag: out of space
pub const NODE_OOS: u32 = 1 << 0;
/// Node-state flag: capacity above the high watermark
pub const NODE_LOW_CAPACITY: u32 = 1 << 1;

/// Concurrent node-state flags, maintained by the stats ticker and read by
/// ingest paths
#[derive(Debug, Default)]
pub struct NodeStateFlags(AtomicU32);

impl NodeStateFlags {
    pub fn set(&self, flags: u32) {
        self.0.fetch_or(flags, Ordering::Relaxed);
    }

    pub fn clear(&self, flags: u32) {
        self.0.fetch_and(!flags, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_set(&self, flags: u32) -> bool {
        self.0.load(Ordering::Relaxed) & flags == flags
    }

    #[must_use]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Display for NodeStateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.load();
        if v == 0 {
            return f.write_str("ok");
        }
        let mut sep = "";
        if v & NODE_OOS != 0 {
            write!(f, "{sep}oos")?;
            sep = ",";
        }
        if v & NODE_LOW_CAPACITY != 0 {
            write!(f, "{sep}low-capacity")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uname_roundtrip() {
        let bck = Bck::local("imagenet");
        let uname = make_uname(&bck, "train/batch-000/img.tar");
        assert_eq!(uname, "local/imagenet/train/batch-000/img.tar");

        let (b, o) = parse_uname(&uname).unwrap();
        assert_eq!(b, bck);
        assert_eq!(o, "train/batch-000/img.tar");
    }

    #[test]
    fn test_uname_objname_with_slashes() {
        let (_, o) = parse_uname("cloud/b/a/b/c//d").unwrap();
        assert_eq!(o, "a/b/c//d");
    }

    #[test]
    fn test_malformed_uname() {
        assert!(parse_uname("local/only-bucket").is_err());
        assert!(parse_uname("martian/b/o").is_err());
    }

    #[test]
    fn test_digest_is_stable() {
        let d1 = uname_digest("local/b/o");
        let d2 = uname_digest("local/b/o");
        assert_eq!(d1, d2);
        assert_ne!(d1, uname_digest("local/b/p"));
    }

    #[test]
    fn test_node_state_flags() {
        let flags = NodeStateFlags::default();
        assert_eq!(flags.to_string(), "ok");

        flags.set(NODE_OOS | NODE_LOW_CAPACITY);
        assert!(flags.is_set(NODE_OOS));
        assert_eq!(flags.to_string(), "oos,low-capacity");

        flags.clear(NODE_OOS);
        assert!(!flags.is_set(NODE_OOS));
        assert!(flags.is_set(NODE_LOW_CAPACITY));
    }
}
