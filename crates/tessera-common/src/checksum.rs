//! Object checksum algorithms
//!
//! Checksums are algorithm-tagged: every stored value carries the algorithm
//! it was computed with, so switching the bucket-level algorithm never
//! invalidates data already on disk. `xxhash64` is the system default;
//! `none` disables validation entirely.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::Xxh64;

use crate::error::{Error, Result};
use crate::mem::BufferPool;

/// Checksum algorithm tag
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// Validation disabled
    None,
    /// xxHash64, the system default
    #[default]
    #[serde(rename = "xxhash")]
    XxHash64,
    Md5,
    Sha256,
}

impl ChecksumType {
    /// Wire/xattr tag byte; stable across releases
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::XxHash64 => 1,
            Self::Md5 => 2,
            Self::Sha256 => 3,
        }
    }

    /// Decode a wire tag; unknown tags are a metadata error at the call site
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::XxHash64),
            2 => Some(Self::Md5),
            3 => Some(Self::Sha256),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::XxHash64 => "xxhash",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChecksumType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "xxhash" => Ok(Self::XxHash64),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            other => Err(Error::config(format!("unknown checksum type {other:?}"))),
        }
    }
}

/// An algorithm-tagged checksum value (hex-encoded)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub ty: ChecksumType,
    pub value: String,
}

impl Checksum {
    #[must_use]
    pub fn new(ty: ChecksumType, value: impl Into<String>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ty, self.value)
    }
}

/// Streaming checksum calculator dispatching over the algorithm tag
pub enum CksumCalc {
    Xx(Xxh64),
    Md5(Md5),
    Sha256(Sha256),
}

impl CksumCalc {
    /// Create a calculator for the given algorithm; `None` is rejected,
    /// validation must be short-circuited before reaching here
    pub fn new(ty: ChecksumType) -> Result<Self> {
        match ty {
            ChecksumType::None => Err(Error::config("cannot compute checksum of type none")),
            ChecksumType::XxHash64 => Ok(Self::Xx(Xxh64::new(0))),
            ChecksumType::Md5 => Ok(Self::Md5(Md5::new())),
            ChecksumType::Sha256 => Ok(Self::Sha256(Sha256::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Xx(h) => h.update(data),
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    #[must_use]
    pub fn finalize(self) -> Checksum {
        match self {
            Self::Xx(h) => Checksum::new(ChecksumType::XxHash64, format!("{:016x}", h.digest())),
            Self::Md5(h) => Checksum::new(ChecksumType::Md5, hex_encode(&h.finalize())),
            Self::Sha256(h) => Checksum::new(ChecksumType::Sha256, hex_encode(&h.finalize())),
        }
    }
}

/// Compute a checksum over the full file contents, streaming through a
/// pooled buffer
pub fn compute_file_checksum(fqn: &Path, ty: ChecksumType, pool: &BufferPool) -> Result<Checksum> {
    let mut calc = CksumCalc::new(ty)?;
    let mut file = File::open(fqn).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::ObjectNotFound(fqn.to_path_buf()),
        _ => Error::unavailable(fqn, e),
    })?;

    let mut buf = pool.get();
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::unavailable(fqn, e))?;
        if n == 0 {
            break;
        }
        calc.update(&buf[..n]);
    }
    pool.put(buf);
    Ok(calc.finalize())
}

/// Hex encode bytes
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tag_roundtrip() {
        for ty in [
            ChecksumType::None,
            ChecksumType::XxHash64,
            ChecksumType::Md5,
            ChecksumType::Sha256,
        ] {
            assert_eq!(ChecksumType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(ChecksumType::from_tag(42), None);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"hello, tessera!";
        let mut one = CksumCalc::new(ChecksumType::XxHash64).unwrap();
        one.update(data);
        let mut two = CksumCalc::new(ChecksumType::XxHash64).unwrap();
        two.update(&data[..5]);
        two.update(&data[5..]);
        assert_eq!(one.finalize(), two.finalize());
    }

    #[test]
    fn test_known_xxhash() {
        let mut calc = CksumCalc::new(ChecksumType::XxHash64).unwrap();
        calc.update(b"");
        let cksum = calc.finalize();
        // xxh64 of the empty input with seed 0
        assert_eq!(cksum.value, format!("{:016x}", 0xef46_db37_51d8_e999_u64));
    }

    #[test]
    fn test_compute_file_checksum() {
        let pool = BufferPool::default();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![7u8; 300 * 1024]).unwrap();

        let a = compute_file_checksum(f.path(), ChecksumType::Sha256, &pool).unwrap();
        let b = compute_file_checksum(f.path(), ChecksumType::Sha256, &pool).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ty, ChecksumType::Sha256);
        assert_eq!(a.value.len(), 64);
    }

    #[test]
    fn test_compute_missing_file() {
        let pool = BufferPool::default();
        let err =
            compute_file_checksum(Path::new("/nonexistent/x"), ChecksumType::XxHash64, &pool)
                .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_none_rejected() {
        assert!(CksumCalc::new(ChecksumType::None).is_err());
    }
}
