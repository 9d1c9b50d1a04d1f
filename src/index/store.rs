use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::bundle::extract_bundle;
use super::checksum::compute_checksum;
use super::ingest::{IndexIngestor, IngestOutcome, SharedManifest};
use super::manifest::{CollectionEntry, CollectionManifest};
use super::vector::LoadedCollection;
use super::{io_error, IndexError};
use crate::core::config::{IndexSettings, IngestSettings};
use crate::embedding::Embedder;

/// Result of one fallback path: a verified entry, or nothing and the caller
/// moves on to the next path.
#[derive(Debug)]
enum PathOutcome {
    Ready(CollectionEntry),
    Unavailable,
}

/// Which path produced a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Cached,
    SchemaRebuild,
    Bundle,
    LocalRebuild,
}

/// Makes subject collections available on disk: verifies manifest entries and
/// falls back to a schema rebuild, bundle installation and local ingestion, in
/// that order.
pub struct IndexStore {
    embeddings_root: PathBuf,
    base_bundle: Option<PathBuf>,
    base_bundle_version: Option<String>,
    subject_bundle_dir: Option<PathBuf>,
    manifest: SharedManifest,
    ingestor: IndexIngestor,
    resolve_lock: tokio::sync::Mutex<()>,
}

impl IndexStore {
    pub fn open(
        settings: &IndexSettings,
        ingest: IngestSettings,
        embedding_batch_size: usize,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        let manifest = Arc::new(Mutex::new(CollectionManifest::open(
            &settings.manifest_path,
            &settings.schema_version,
        )?));
        let ingestor = IndexIngestor::new(
            &settings.data_root,
            &settings.embeddings_root,
            ingest,
            embedding_batch_size,
            embedder,
            manifest.clone(),
        );
        Ok(Self {
            embeddings_root: settings.embeddings_root.clone(),
            base_bundle: settings.base_bundle.clone(),
            base_bundle_version: settings.base_bundle_version.clone(),
            subject_bundle_dir: settings.subject_bundle_dir.clone(),
            manifest,
            ingestor,
            resolve_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn manifest(&self) -> &SharedManifest {
        &self.manifest
    }

    pub fn ingestor(&self) -> &IndexIngestor {
        &self.ingestor
    }

    pub async fn ensure_collection(&self, subject: &str, auto_install: bool) -> Result<CollectionEntry, IndexError> {
        self.resolve_collection(subject, auto_install)
            .await
            .map(|(entry, _)| entry)
    }

    /// Like [`ensure_collection`](Self::ensure_collection), also reporting
    /// which path succeeded. Resolutions are serialized so two requests never
    /// rebuild the same subject at once.
    pub async fn resolve_collection(
        &self,
        subject: &str,
        auto_install: bool,
    ) -> Result<(CollectionEntry, Resolution), IndexError> {
        let _guard = self.resolve_lock.lock().await;

        if let PathOutcome::Ready(entry) = self.check(subject) {
            return Ok((entry, Resolution::Cached));
        }

        if let PathOutcome::Ready(entry) = self.schema_rebuild(subject).await {
            return Ok((entry, Resolution::SchemaRebuild));
        }

        if auto_install {
            if let PathOutcome::Ready(entry) = self.bundle_install(subject) {
                return Ok((entry, Resolution::Bundle));
            }
        }

        if let PathOutcome::Ready(entry) = self.local_rebuild(subject).await {
            return Ok((entry, Resolution::LocalRebuild));
        }

        tracing::warn!("Collection '{}' is unavailable", subject);
        Err(IndexError::Unavailable(subject.to_string()))
    }

    /// Both artifacts exist and, when the entry carries digests, both match.
    pub fn verify_entry(&self, entry: &CollectionEntry) -> bool {
        let manifest = self.lock_manifest();
        verify_with(&manifest, entry)
    }

    pub fn load_collection(&self, entry: &CollectionEntry) -> Result<LoadedCollection, IndexError> {
        let (index_path, metadata_path) = {
            let manifest = self.lock_manifest();
            (
                manifest.resolve_path(&entry.files.index),
                manifest.resolve_path(&entry.files.metadata),
            )
        };
        let collection = LoadedCollection::read(&entry.subject, &index_path, &metadata_path)?;
        tracing::info!(
            "Loaded index for '{}' with {} vectors",
            entry.subject,
            collection.index.len()
        );
        Ok(collection)
    }

    /// Extracts the base bundle and the subject's bundle when present.
    /// Returns whether anything was extracted.
    pub fn install_from_bundles(&self, subject: &str) -> bool {
        let mut installed = false;

        if let Some(base) = self.base_bundle.as_deref().filter(|p| p.is_file()) {
            if self.base_bundle_current(subject) {
                tracing::debug!("Base bundle {} already installed", base.display());
            } else if self.extract(base) {
                installed = true;
                if let Some(version) = &self.base_bundle_version {
                    let mut manifest = self.lock_manifest();
                    if let Err(err) = manifest.set_base_bundle_version(Some(version.clone())) {
                        tracing::warn!("Failed to record base bundle version: {}", err);
                    }
                }
            }
        }

        if let Some(dir) = &self.subject_bundle_dir {
            let bundle = dir.join(format!("{}.zip", subject));
            if bundle.is_file() && self.extract(&bundle) {
                installed = true;
            }
        }

        installed
    }

    /// Rebuilds `subject` from `<data_root>/<subject>/`. A missing directory is
    /// reported as [`IngestOutcome::NoDocuments`].
    pub async fn rebuild_collection(&self, subject: &str) -> Result<IngestOutcome, IndexError> {
        self.ingestor.create_index(subject, None).await
    }

    /// Deletes every built artifact under the embeddings root.
    pub fn purge(&self) -> Result<(), IndexError> {
        if self.embeddings_root.is_dir() {
            tracing::info!("Purging {}", self.embeddings_root.display());
            fs::remove_dir_all(&self.embeddings_root).map_err(io_error(&self.embeddings_root))?;
        }
        let manifest_dir = self.lock_manifest().directory();
        fs::create_dir_all(&manifest_dir).map_err(io_error(&manifest_dir))?;
        Ok(())
    }

    fn check(&self, subject: &str) -> PathOutcome {
        let manifest = self.lock_manifest();
        match manifest.get_collection(subject) {
            Some(entry) if verify_with(&manifest, &entry) => PathOutcome::Ready(entry),
            Some(_) => {
                tracing::info!("Collection '{}' failed verification", subject);
                PathOutcome::Unavailable
            }
            None => PathOutcome::Unavailable,
        }
    }

    fn recheck(&self, subject: &str) -> PathOutcome {
        if let Err(err) = self.lock_manifest().reload() {
            tracing::warn!("Failed to reload manifest: {}", err);
        }
        self.check(subject)
    }

    async fn schema_rebuild(&self, subject: &str) -> PathOutcome {
        if !self.lock_manifest().take_schema_migration() {
            return PathOutcome::Unavailable;
        }
        tracing::info!("Manifest schema changed; rebuilding '{}' from source", subject);

        if let Err(err) = self.purge() {
            tracing::warn!("Failed to purge stale indexes: {}", err);
        }
        if let Err(err) = self.lock_manifest().reset() {
            tracing::warn!("Failed to reset manifest: {}", err);
        }
        if let Err(err) = self.rebuild_collection(subject).await {
            tracing::warn!("Schema rebuild of '{}' failed: {}", subject, err);
        }
        self.recheck(subject)
    }

    fn bundle_install(&self, subject: &str) -> PathOutcome {
        if !self.install_from_bundles(subject) {
            return PathOutcome::Unavailable;
        }
        self.check(subject)
    }

    async fn local_rebuild(&self, subject: &str) -> PathOutcome {
        if !self.ingestor.subject_dir(subject).is_dir() {
            tracing::debug!("No local sources for '{}'", subject);
            return PathOutcome::Unavailable;
        }
        match self.rebuild_collection(subject).await {
            Ok(IngestOutcome::Indexed(_)) => self.recheck(subject),
            Ok(IngestOutcome::NoDocuments) => PathOutcome::Unavailable,
            Err(err) => {
                tracing::warn!("Local rebuild of '{}' failed: {}", subject, err);
                PathOutcome::Unavailable
            }
        }
    }

    /// The base bundle is skipped when the manifest records the configured
    /// version and has no broken entry for `subject` that it could repair.
    fn base_bundle_current(&self, subject: &str) -> bool {
        let Some(configured) = self.base_bundle_version.as_deref() else {
            return false;
        };
        let manifest = self.lock_manifest();
        manifest.base_bundle_version() == Some(configured) && manifest.get_collection(subject).is_none()
    }

    fn extract(&self, bundle: &Path) -> bool {
        let target = self
            .embeddings_root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        match extract_bundle(bundle, &target) {
            Ok(_) => {
                if let Err(err) = self.lock_manifest().reload() {
                    tracing::warn!("Failed to reload manifest after {}: {}", bundle.display(), err);
                }
                true
            }
            Err(err) => {
                tracing::warn!("Skipping bundle {}: {}", bundle.display(), err);
                false
            }
        }
    }

    fn lock_manifest(&self) -> MutexGuard<'_, CollectionManifest> {
        self.manifest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn verify_with(manifest: &CollectionManifest, entry: &CollectionEntry) -> bool {
    let index_path = manifest.resolve_path(&entry.files.index);
    let metadata_path = manifest.resolve_path(&entry.files.metadata);
    if !index_path.is_file() || !metadata_path.is_file() {
        return false;
    }
    if !entry.expects_checksums() {
        return true;
    }
    let Some(expected) = &entry.checksums else {
        return true;
    };
    digest_matches(&index_path, expected.index.as_deref())
        && digest_matches(&metadata_path, expected.metadata.as_deref())
}

fn digest_matches(path: &Path, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    match compute_checksum(path) {
        Ok(actual) => actual.eq_ignore_ascii_case(expected),
        Err(err) => {
            tracing::warn!("Cannot checksum {}: {}", path.display(), err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::bundle::tests::write_zip;
    use crate::testing::FakeEmbedder;

    struct Fixture {
        root: tempfile::TempDir,
        embedder: Arc<FakeEmbedder>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                embedder: Arc::new(FakeEmbedder::default()),
            }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.root.path().join(relative)
        }

        fn settings(&self) -> IndexSettings {
            IndexSettings {
                embeddings_root: self.path("embeddings/collections"),
                manifest_path: self.path("embeddings/index_manifest.json"),
                data_root: self.path("data"),
                base_bundle: None,
                base_bundle_version: None,
                subject_bundle_dir: None,
                schema_version: "1".to_string(),
            }
        }

        fn store(&self, settings: &IndexSettings) -> IndexStore {
            IndexStore::open(settings, IngestSettings::default(), 16, self.embedder.clone()).unwrap()
        }

        fn write_source(&self, subject: &str, text: &str) {
            let dir = self.path(&format!("data/{}", subject));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("apuntes.txt"), text).unwrap();
        }
    }

    /// Builds `subject` in a scratch tree and zips the manifest and artifacts
    /// relative to the embeddings directory.
    async fn build_bundle(subject: &str, target: &Path) {
        let scratch = Fixture::new();
        scratch.write_source(subject, "El movimiento rectilíneo uniforme.");
        let store = scratch.store(&scratch.settings());
        store.ensure_collection(subject, false).await.unwrap();

        let manifest = fs::read(scratch.path("embeddings/index_manifest.json")).unwrap();
        let index = fs::read(scratch.path(&format!("embeddings/collections/{}/vectors.idx", subject))).unwrap();
        let metadata =
            fs::read(scratch.path(&format!("embeddings/collections/{}/metadata.json", subject))).unwrap();
        let index_name = format!("collections/{}/vectors.idx", subject);
        let metadata_name = format!("collections/{}/metadata.json", subject);
        write_zip(
            target,
            &[
                ("index_manifest.json", manifest.as_slice()),
                (index_name.as_str(), index.as_slice()),
                (metadata_name.as_str(), metadata.as_slice()),
            ],
        );
    }

    #[tokio::test]
    async fn verified_entry_is_served_from_manifest() {
        let fx = Fixture::new();
        fx.write_source("Matematicas", "Una derivada mide el cambio instantáneo.");
        let store = fx.store(&fx.settings());

        let (_, first) = store.resolve_collection("Matematicas", true).await.unwrap();
        let calls = fx.embedder.calls();
        let (entry, second) = store.resolve_collection("Matematicas", true).await.unwrap();

        assert_eq!(first, Resolution::LocalRebuild);
        assert_eq!(second, Resolution::Cached);
        assert_eq!(fx.embedder.calls(), calls);
        assert!(store.verify_entry(&entry));
    }

    #[tokio::test]
    async fn tampered_artifact_is_never_returned_as_cached() {
        let fx = Fixture::new();
        fx.write_source("Historia", "La revolución francesa comenzó en 1789.");
        let store = fx.store(&fx.settings());
        let entry = store.ensure_collection("Historia", true).await.unwrap();

        let metadata_path = fx.path("embeddings/collections/Historia/metadata.json");
        fs::write(&metadata_path, b"[]").unwrap();
        assert!(!store.verify_entry(&entry));

        let (rebuilt, resolution) = store.resolve_collection("Historia", true).await.unwrap();
        assert_eq!(resolution, Resolution::LocalRebuild);
        assert!(store.verify_entry(&rebuilt));
    }

    #[tokio::test]
    async fn bundle_is_preferred_over_local_rebuild() {
        let fx = Fixture::new();
        let bundles = fx.path("bundles");
        fs::create_dir_all(&bundles).unwrap();
        build_bundle("Fisica", &bundles.join("Fisica.zip")).await;
        fx.write_source("Fisica", "Texto local que no debería usarse.");

        let settings = IndexSettings {
            subject_bundle_dir: Some(bundles),
            ..fx.settings()
        };
        let store = fx.store(&settings);
        let (entry, resolution) = store.resolve_collection("Fisica", true).await.unwrap();

        assert_eq!(resolution, Resolution::Bundle);
        assert_eq!(fx.embedder.calls(), 0);
        let collection = store.load_collection(&entry).unwrap();
        assert_eq!(collection.metadata[0].text, "El movimiento rectilíneo uniforme.");
    }

    #[tokio::test]
    async fn auto_install_off_skips_bundles() {
        let fx = Fixture::new();
        let bundles = fx.path("bundles");
        fs::create_dir_all(&bundles).unwrap();
        build_bundle("Fisica", &bundles.join("Fisica.zip")).await;

        let settings = IndexSettings {
            subject_bundle_dir: Some(bundles),
            ..fx.settings()
        };
        let store = fx.store(&settings);
        let err = store.ensure_collection("Fisica", false).await.unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(ref s) if s == "Fisica"));
    }

    #[tokio::test]
    async fn base_bundle_version_is_recorded_once_installed() {
        let fx = Fixture::new();
        let base = fx.path("base.zip");
        build_bundle("base", &base).await;

        let settings = IndexSettings {
            base_bundle: Some(base),
            base_bundle_version: Some("2025.01".to_string()),
            ..fx.settings()
        };
        let store = fx.store(&settings);
        let (_, resolution) = store.resolve_collection("base", true).await.unwrap();
        assert_eq!(resolution, Resolution::Bundle);
        assert_eq!(
            store.manifest().lock().unwrap().base_bundle_version(),
            Some("2025.01")
        );
        // the base bundle has no Lengua collection; it is not extracted again
        assert!(!store.install_from_bundles("Lengua"));
    }

    #[tokio::test]
    async fn stale_schema_purges_and_rebuilds() {
        let fx = Fixture::new();
        fx.write_source("Filosofia", "¿Qué es el ser?");
        let stale = fx.path("embeddings/collections/Old/vectors.idx");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();
        fs::write(
            fx.path("embeddings/index_manifest.json"),
            br#"{"schema_version": "0", "collections": {}}"#,
        )
        .unwrap();

        let store = fx.store(&fx.settings());
        let (entry, resolution) = store.resolve_collection("Filosofia", true).await.unwrap();

        assert_eq!(resolution, Resolution::SchemaRebuild);
        assert!(!stale.exists());
        assert_eq!(entry.subject, "Filosofia");
    }

    #[tokio::test]
    async fn nothing_available_is_an_error() {
        let fx = Fixture::new();
        let store = fx.store(&fx.settings());
        let err = store.ensure_collection("Lengua", true).await.unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_)));
    }

    #[tokio::test]
    async fn corrupt_bundle_falls_through_to_local_rebuild() {
        let fx = Fixture::new();
        let bundles = fx.path("bundles");
        fs::create_dir_all(&bundles).unwrap();
        fs::write(bundles.join("Ingles.zip"), b"garbage").unwrap();
        fx.write_source("Ingles", "The verb to be.");

        let settings = IndexSettings {
            subject_bundle_dir: Some(bundles),
            ..fx.settings()
        };
        let store = fx.store(&settings);
        let (_, resolution) = store.resolve_collection("Ingles", true).await.unwrap();
        assert_eq!(resolution, Resolution::LocalRebuild);
    }
}
