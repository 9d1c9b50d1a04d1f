use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{io_error, IndexError};

/// The two artifacts of a collection, keyed the same way in every section of
/// a manifest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPair<T: Default> {
    pub index: T,
    pub metadata: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub subject: String,
    pub version: String,
    pub vectors: usize,
    pub files: ArtifactPair<PathBuf>,
    #[serde(default)]
    pub size_bytes: ArtifactPair<u64>,
    /// Absent for bundles produced without digests; only existence is
    /// checked then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums: Option<ArtifactPair<Option<String>>>,
}

impl CollectionEntry {
    pub fn expects_checksums(&self) -> bool {
        self.checksums
            .as_ref()
            .is_some_and(|c| c.index.is_some() || c.metadata.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    #[serde(default, deserialize_with = "schema_tag")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub base_bundle_version: Option<String>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionEntry>,
}

impl ManifestDocument {
    pub fn empty(schema_version: &str) -> Self {
        Self {
            schema_version: Some(schema_version.to_string()),
            base_bundle_version: None,
            collections: BTreeMap::new(),
        }
    }
}

// Older manifests wrote the schema tag as a bare number.
fn schema_tag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(tag)) => Some(tag),
        Some(Value::Number(tag)) => Some(tag.to_string()),
        _ => None,
    })
}

/// The manifest file describing every installed collection.
///
/// Not internally synchronized; owners wrap it in a mutex. Saves additionally
/// take an advisory lock on a sibling `.lock` file so two processes never
/// interleave writes.
#[derive(Debug)]
pub struct CollectionManifest {
    path: PathBuf,
    expected_schema: String,
    document: ManifestDocument,
    schema_migrated: bool,
}

impl CollectionManifest {
    pub fn open(path: impl Into<PathBuf>, expected_schema: &str) -> Result<Self, IndexError> {
        let mut manifest = Self {
            path: path.into(),
            expected_schema: expected_schema.to_string(),
            document: ManifestDocument::empty(expected_schema),
            schema_migrated: false,
        };
        manifest.load()?;
        Ok(manifest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &ManifestDocument {
        &self.document
    }

    pub fn expected_schema(&self) -> &str {
        &self.expected_schema
    }

    /// Reads the file if present. A stale schema tag or an unparseable file
    /// resets the manifest and leaves a pending migration for
    /// [`take_schema_migration`](Self::take_schema_migration).
    pub fn load(&mut self) -> Result<(), IndexError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.document = ManifestDocument::empty(&self.expected_schema);
                return Ok(());
            }
            Err(err) => return Err(io_error(&self.path)(err)),
        };

        match serde_json::from_slice::<ManifestDocument>(&bytes) {
            Ok(document) if document.schema_version.as_deref() == Some(self.expected_schema.as_str()) => {
                self.document = document;
                Ok(())
            }
            Ok(document) => {
                tracing::info!(
                    "Manifest schema {:?} differs from {}; resetting {}",
                    document.schema_version,
                    self.expected_schema,
                    self.path.display()
                );
                self.schema_migrated = true;
                self.reset()
            }
            Err(err) => {
                tracing::warn!(
                    "Manifest {} is unreadable ({}); resetting",
                    self.path.display(),
                    err
                );
                self.schema_migrated = true;
                self.reset()
            }
        }
    }

    pub fn reload(&mut self) -> Result<(), IndexError> {
        self.load()
    }

    /// Returns and clears the pending migration flag set by [`load`](Self::load).
    pub fn take_schema_migration(&mut self) -> bool {
        std::mem::take(&mut self.schema_migrated)
    }

    pub fn reset(&mut self) -> Result<(), IndexError> {
        self.document = ManifestDocument::empty(&self.expected_schema);
        self.save()
    }

    pub fn save(&self) -> Result<(), IndexError> {
        let dir = self.directory();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let lock_path = sibling(&self.path, "lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        lock.lock_exclusive().map_err(io_error(&lock_path))?;

        let result = self.write_atomically();
        let _ = FileExt::unlock(&lock);
        result
    }

    fn write_atomically(&self) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec_pretty(&self.document).map_err(|source| IndexError::Json {
            path: self.path.clone(),
            source,
        })?;
        let tmp = sibling(&self.path, &format!("tmp-{}", std::process::id()));
        fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&self.path)(err));
        }
        Ok(())
    }

    /// Replaces the entry for `subject` wholesale and persists immediately.
    pub fn update_collection(&mut self, subject: &str, entry: CollectionEntry) -> Result<(), IndexError> {
        self.document.collections.insert(subject.to_string(), entry);
        self.save()
    }

    pub fn get_collection(&self, subject: &str) -> Option<CollectionEntry> {
        self.document.collections.get(subject).cloned()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.document.collections.keys().cloned().collect()
    }

    pub fn base_bundle_version(&self) -> Option<&str> {
        self.document.base_bundle_version.as_deref()
    }

    pub fn set_base_bundle_version(&mut self, version: Option<String>) -> Result<(), IndexError> {
        self.document.base_bundle_version = version;
        self.save()
    }

    /// Directory relative artifact paths are anchored at.
    pub fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.directory().join(path)
        }
    }

    /// Inverse of [`resolve_path`](Self::resolve_path) for paths under the
    /// manifest directory; other paths are kept as given.
    pub fn relativize(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.directory())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "manifest".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
