use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::{io_error, IndexError};

const READ_BUFFER: usize = 8 * 1024;

/// Lower-case hex SHA-256 of a file, read in fixed-size blocks.
pub fn compute_checksum(path: &Path) -> Result<String, IndexError> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer).map_err(io_error(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_checksum(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn spans_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![7u8; READ_BUFFER * 3 + 11];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(compute_checksum(&path).unwrap(), hex::encode(Sha256::digest(&data)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_checksum(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, IndexError::Io { .. }));
    }
}
