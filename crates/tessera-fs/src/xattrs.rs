//! Extended-attribute I/O for the metadata blob
//!
//! Distinguishes three failure modes the callers handle differently:
//! the file is gone (`ObjectNotFound`), the file exists but carries no
//! record (`NoMetadata`), and everything else (`Unavailable`, escalated
//! to the health checker by the caller).

use std::io::ErrorKind;
use std::path::Path;

use tessera_common::{Error, Result};

/// Attribute carrying the serialized object metadata
pub const LOM_XATTR_NAME: &str = "user.tessera.lom";

/// Read the raw metadata blob off a file
pub fn get_blob(fqn: &Path) -> Result<Vec<u8>> {
    match xattr::get(fqn, LOM_XATTR_NAME) {
        Ok(Some(blob)) => Ok(blob),
        Ok(None) => Err(Error::NoMetadata(fqn.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ObjectNotFound(fqn.to_path_buf())),
        Err(e) => Err(Error::unavailable(fqn, e)),
    }
}

/// Write the metadata blob; atomic on the target filesystem
pub fn set_blob(fqn: &Path, blob: &[u8]) -> Result<()> {
    match xattr::set(fqn, LOM_XATTR_NAME, blob) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ObjectNotFound(fqn.to_path_buf())),
        Err(e) => Err(Error::unavailable(fqn, e)),
    }
}

/// Remove the metadata record, tolerating its absence
pub fn remove_blob(fqn: &Path) -> Result<()> {
    match xattr::remove(fqn, LOM_XATTR_NAME) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(no_attr_errno()) => Ok(()),
        Err(e) => Err(Error::unavailable(fqn, e)),
    }
}

#[cfg(target_os = "linux")]
const fn no_attr_errno() -> i32 {
    61 // ENODATA
}

#[cfg(not(target_os = "linux"))]
const fn no_attr_errno() -> i32 {
    93 // ENOATTR on the BSDs / macOS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_blob_roundtrip_and_distinguished_errors() {
        let dir = TempDir::new().unwrap();
        let fqn = dir.path().join("o");

        // file absent
        assert!(get_blob(&fqn).unwrap_err().is_not_found());
        assert!(matches!(
            set_blob(&fqn, b"x").unwrap_err(),
            Error::ObjectNotFound(_)
        ));

        File::create(&fqn).unwrap();

        // file present, no record
        match get_blob(&fqn) {
            Err(Error::NoMetadata(_)) => {}
            other => panic!("expected NoMetadata, got {other:?}"),
        }

        // roundtrip (skipped when the filesystem disallows user xattrs)
        if set_blob(&fqn, b"\x01\x02\x03").is_ok() {
            assert_eq!(get_blob(&fqn).unwrap(), vec![1, 2, 3]);
            remove_blob(&fqn).unwrap();
            assert!(matches!(get_blob(&fqn), Err(Error::NoMetadata(_))));
        }

        // removing an absent record is benign
        remove_blob(&fqn).unwrap();
    }
}
