//! SHA-256 content fingerprints for change records.

use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{io_err, TransferError};
use crate::transfer::open_shared;

/// Size and lowercase hex SHA-256 of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

/// Stream `path` through SHA-256 without loading it whole.
///
/// The file is opened with shared access so writers that still hold it open
/// are not disturbed.
pub fn file_digest(path: &Path) -> Result<FileDigest, TransferError> {
    let file = open_shared(path).map_err(|e| io_err(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = reader.read(&mut buf).map_err(|e| io_err(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }
    Ok(FileDigest {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn digest_matches_known_value() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let digest = file_digest(&path).unwrap();
        assert_eq!(digest.size, 5);
        assert_eq!(
            digest.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn missing_file_is_an_io_error_with_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.txt");
        let err = file_digest(&path).unwrap_err();
        assert!(matches!(err, TransferError::Io { .. }));
        assert!(err.to_string().contains("gone.txt"));
    }
}
