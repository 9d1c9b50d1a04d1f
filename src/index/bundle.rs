use std::fs;
use std::path::Path;

use zip::ZipArchive;

use super::{io_error, IndexError};

/// Extracts a zip bundle under `destination`. Members with absolute paths or
/// `..` components fail the whole extraction.
pub fn extract_bundle(archive_path: &Path, destination: &Path) -> Result<usize, IndexError> {
    let bundle_err = |reason: String| IndexError::Bundle {
        path: archive_path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(archive_path).map_err(io_error(archive_path))?;
    let mut zip = ZipArchive::new(file).map_err(|e| bundle_err(e.to_string()))?;
    let mut extracted = 0;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| bundle_err(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(bundle_err(format!("unsafe archive entry: {}", entry.name())));
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut outfile = fs::File::create(&target).map_err(io_error(&target))?;
        std::io::copy(&mut entry, &mut outfile).map_err(io_error(&target))?;
        extracted += 1;
    }

    tracing::info!(
        "Extracted {} files from {} into {}",
        extracted,
        archive_path.display(),
        destination.display()
    );
    Ok(extracted)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::*;

    pub(crate) fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (name, data) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_nested_members() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("base.zip");
        write_zip(
            &archive,
            &[
                ("embeddings/index_manifest.json", b"{}".as_slice()),
                ("embeddings/collections/base/metadata.json", b"[]".as_slice()),
            ],
        );

        let count = extract_bundle(&archive, &dir.path().join("out")).unwrap();
        assert_eq!(count, 2);
        assert!(dir
            .path()
            .join("out/embeddings/collections/base/metadata.json")
            .is_file());
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", b"x".as_slice())]);

        let err = extract_bundle(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, IndexError::Bundle { .. }));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn corrupt_archive_is_a_bundle_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"PK not really").unwrap();
        assert!(matches!(
            extract_bundle(&archive, dir.path()),
            Err(IndexError::Bundle { .. })
        ));
    }
}
