//! On-disk object metadata blob
//!
//! The serialized record stored in the object's extended attribute:
//!
//! ```text
//! +-------------------+
//! | magic     (u32 LE)|
//! | version   (u8)    |
//! | meta-ver  (u8)    |
//! +-------------------+
//! | tag (u8)          |  repeated typed fields:
//! | len (uvarint)     |  size, version, atime, checksum, copies[]
//! | bytes [len]       |
//! +-------------------+
//! | crc32c    (u32 LE)|  over all preceding bytes
//! +-------------------+
//! ```
//!
//! Unknown tags are skipped on decode to preserve forward compatibility.

use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use tessera_common::{Checksum, ChecksumType, Error, Result};

/// Blob magic, "TLM\0"
pub const META_MAGIC: u32 = 0x544C_4D00;
/// Serialization format version
pub const META_FORMAT_VERSION: u8 = 1;
/// Semantic version of the field set
pub const META_VERSION: u8 = 1;

const TAG_SIZE: u8 = 1;
const TAG_VERSION: u8 = 2;
const TAG_ATIME: u8 = 3;
const TAG_CKSUM: u8 = 4;
const TAG_COPY: u8 = 5;

/// Decoded metadata record; the in-memory `lmeta` persists through this
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobMeta {
    pub size: i64,
    pub version: Option<String>,
    /// ns since epoch, as last persisted
    pub atime: i64,
    pub cksum: Option<Checksum>,
    /// FQNs of the replicas on other mountpaths
    pub copies: Vec<String>,
}

impl BlobMeta {
    /// Serialize to the xattr wire format
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32_le(META_MAGIC);
        buf.put_u8(META_FORMAT_VERSION);
        buf.put_u8(META_VERSION);

        put_field(&mut buf, TAG_SIZE, &self.size.to_le_bytes());
        if let Some(v) = &self.version {
            put_field(&mut buf, TAG_VERSION, v.as_bytes());
        }
        put_field(&mut buf, TAG_ATIME, &self.atime.to_le_bytes());
        if let Some(cksum) = &self.cksum {
            let mut field = Vec::with_capacity(1 + cksum.value.len());
            field.push(cksum.ty.tag());
            field.extend_from_slice(cksum.value.as_bytes());
            put_field(&mut buf, TAG_CKSUM, &field);
        }
        for copy in &self.copies {
            put_field(&mut buf, TAG_COPY, copy.as_bytes());
        }

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    /// Parse the xattr wire format; `fqn` is for error context only
    pub fn decode(data: &[u8], fqn: &Path) -> Result<Self> {
        let bad = |reason: &str| Error::BadMeta {
            fqn: fqn.to_path_buf(),
            reason: reason.to_owned(),
        };

        if data.len() < 4 + 2 + 4 {
            return Err(bad("record too short"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let crc = u32::from_le_bytes(trailer.try_into().unwrap());
        if crc32c::crc32c(body) != crc {
            return Err(bad("crc mismatch"));
        }

        let mut buf = body;
        if buf.get_u32_le() != META_MAGIC {
            return Err(bad("bad magic"));
        }
        if buf.get_u8() != META_FORMAT_VERSION {
            return Err(bad("unsupported format version"));
        }
        let _meta_version = buf.get_u8();

        let mut meta = Self::default();
        while buf.has_remaining() {
            let tag = buf.get_u8();
            let len = get_uvarint(&mut buf).ok_or_else(|| bad("truncated field length"))?;
            if buf.remaining() < len {
                return Err(bad("truncated field"));
            }
            let field = &buf[..len];
            match tag {
                TAG_SIZE => meta.size = field_i64(field).ok_or_else(|| bad("bad size field"))?,
                TAG_VERSION => {
                    meta.version = Some(field_str(field).ok_or_else(|| bad("bad version"))?);
                }
                TAG_ATIME => {
                    meta.atime = field_i64(field).ok_or_else(|| bad("bad atime field"))?;
                }
                TAG_CKSUM => {
                    let (&ty, value) =
                        field.split_first().ok_or_else(|| bad("empty checksum"))?;
                    let ty = ChecksumType::from_tag(ty)
                        .ok_or_else(|| bad("unknown checksum algorithm"))?;
                    let value = field_str(value).ok_or_else(|| bad("bad checksum value"))?;
                    meta.cksum = Some(Checksum::new(ty, value));
                }
                TAG_COPY => {
                    meta.copies
                        .push(field_str(field).ok_or_else(|| bad("bad copy fqn"))?);
                }
                // forward compat: skip what we do not know
                _ => {}
            }
            buf.advance(len);
        }
        Ok(meta)
    }
}

fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    put_uvarint(buf, value.len() as u64);
    buf.put_slice(value);
}

fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_uvarint(buf: &mut &[u8]) -> Option<usize> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() || shift > 63 {
            return None;
        }
        let b = buf.get_u8();
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return usize::try_from(v).ok();
        }
        shift += 7;
    }
}

fn field_i64(field: &[u8]) -> Option<i64> {
    field.try_into().ok().map(i64::from_le_bytes)
}

fn field_str(field: &[u8]) -> Option<String> {
    std::str::from_utf8(field).ok().map(str::to_owned)
}
