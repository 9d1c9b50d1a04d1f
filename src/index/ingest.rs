use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;

use super::checksum::compute_checksum;
use super::documents::{chunk_text, load_documents};
use super::manifest::{ArtifactPair, CollectionEntry, CollectionManifest};
use super::vector::{write_metadata, ChunkMetadata, VectorIndex};
use super::{io_error, IndexError};
use crate::core::config::IngestSettings;
use crate::embedding::{Embedder, EmbeddingError};

pub const INDEX_FILE: &str = "vectors.idx";
pub const METADATA_FILE: &str = "metadata.json";

pub type SharedManifest = Arc<Mutex<CollectionManifest>>;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Indexed(CollectionEntry),
    /// The subject directory is missing or holds no readable documents.
    NoDocuments,
}

/// Builds a subject's artifact pair from `<data_root>/<subject>/` and records
/// it in the manifest.
pub struct IndexIngestor {
    data_root: PathBuf,
    embeddings_root: PathBuf,
    settings: IngestSettings,
    batch_size: usize,
    embedder: Arc<dyn Embedder>,
    manifest: SharedManifest,
}

impl IndexIngestor {
    pub fn new(
        data_root: impl Into<PathBuf>,
        embeddings_root: impl Into<PathBuf>,
        settings: IngestSettings,
        batch_size: usize,
        embedder: Arc<dyn Embedder>,
        manifest: SharedManifest,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            embeddings_root: embeddings_root.into(),
            settings,
            batch_size: batch_size.max(1),
            embedder,
            manifest,
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.data_root.join(subject)
    }

    pub async fn create_index(&self, subject: &str, version: Option<&str>) -> Result<IngestOutcome, IndexError> {
        let subject_dir = self.subject_dir(subject);
        if !subject_dir.is_dir() {
            tracing::info!(
                "No documents found for subject '{}' in {}",
                subject,
                subject_dir.display()
            );
            return Ok(IngestOutcome::NoDocuments);
        }

        let documents = tokio::task::spawn_blocking(move || load_documents(&subject_dir))
            .await
            .map_err(|e| IndexError::Task(e.to_string()))?;
        if documents.is_empty() {
            tracing::info!("No documents to process for subject '{}'", subject);
            return Ok(IngestOutcome::NoDocuments);
        }

        let mut texts = Vec::new();
        let mut metadata = Vec::new();
        for document in &documents {
            for chunk in chunk_text(&document.text, self.settings.chunk_size, self.settings.chunk_overlap) {
                metadata.push(ChunkMetadata {
                    subject: subject.to_string(),
                    source: document.source.clone(),
                    text: chunk.clone(),
                });
                texts.push(chunk);
            }
        }
        if texts.is_empty() {
            return Err(IndexError::NoChunks(subject.to_string()));
        }

        tracing::info!(
            "Generating embeddings for {} chunks of '{}'",
            texts.len(),
            subject
        );
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embedder.embed(batch).await?);
        }
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            ))
            .into());
        }
        let index = VectorIndex::from_vectors(&vectors)
            .map_err(|reason| IndexError::from(EmbeddingError::InvalidResponse(reason)))?;

        let version = version
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("%Y.%m.%d").to_string());
        let entry = self.persist(subject, &index, &metadata, version)?;
        Ok(IngestOutcome::Indexed(entry))
    }

    fn persist(
        &self,
        subject: &str,
        index: &VectorIndex,
        metadata: &[ChunkMetadata],
        version: String,
    ) -> Result<CollectionEntry, IndexError> {
        let subject_dir = self.embeddings_root.join(subject);
        fs::create_dir_all(&subject_dir).map_err(io_error(&subject_dir))?;

        let index_path = subject_dir.join(INDEX_FILE);
        let metadata_path = subject_dir.join(METADATA_FILE);
        index.write_to(&index_path)?;
        write_metadata(&metadata_path, metadata)?;

        let size_of = |path: &Path| fs::metadata(path).map(|m| m.len()).map_err(io_error(path));
        let size_bytes = ArtifactPair {
            index: size_of(&index_path)?,
            metadata: size_of(&metadata_path)?,
        };
        let checksums = ArtifactPair {
            index: Some(compute_checksum(&index_path)?),
            metadata: Some(compute_checksum(&metadata_path)?),
        };

        let mut manifest = self.manifest.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = CollectionEntry {
            subject: subject.to_string(),
            version,
            vectors: metadata.len(),
            files: ArtifactPair {
                index: manifest.relativize(&index_path),
                metadata: manifest.relativize(&metadata_path),
            },
            size_bytes,
            checksums: Some(checksums),
        };
        manifest.update_collection(subject, entry.clone())?;

        tracing::info!(
            "Index for '{}' saved to {} with version {}",
            subject,
            subject_dir.display(),
            entry.version
        );
        Ok(entry)
    }

    /// Builds each subject in turn. Failures are logged and do not stop the
    /// remaining subjects.
    pub async fn create_indexes_for_subjects(
        &self,
        subjects: &[String],
        version: Option<&str>,
    ) -> Vec<(String, Result<IngestOutcome, IndexError>)> {
        let mut results = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let result = self.create_index(subject, version).await;
            if let Err(err) = &result {
                tracing::warn!("Failed to create index for '{}': {}", subject, err);
            }
            results.push((subject.clone(), result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEmbedder;

    fn ingestor(root: &Path, embedder: Arc<FakeEmbedder>) -> (IndexIngestor, SharedManifest) {
        let manifest = Arc::new(Mutex::new(
            CollectionManifest::open(root.join("embeddings/index_manifest.json"), "1").unwrap(),
        ));
        let ingestor = IndexIngestor::new(
            root.join("data"),
            root.join("embeddings/collections"),
            IngestSettings::default(),
            4,
            embedder,
            manifest.clone(),
        );
        (ingestor, manifest)
    }

    #[tokio::test]
    async fn builds_verified_artifacts_and_manifest_entry() {
        let root = tempfile::tempdir().unwrap();
        let subject_dir = root.path().join("data/Matematicas");
        fs::create_dir_all(&subject_dir).unwrap();
        fs::write(subject_dir.join("derivadas.txt"), "La derivada mide el cambio. ".repeat(40)).unwrap();

        let embedder = Arc::new(FakeEmbedder::default());
        let (ingestor, manifest) = ingestor(root.path(), embedder.clone());
        let outcome = ingestor.create_index("Matematicas", Some("2025.01.31")).await.unwrap();

        let IngestOutcome::Indexed(entry) = outcome else {
            panic!("expected an index");
        };
        assert_eq!(entry.version, "2025.01.31");
        assert_eq!(entry.vectors, 3);
        assert_eq!(embedder.embedded_texts(), 3);
        assert_eq!(entry.files.index, PathBuf::from("collections/Matematicas/vectors.idx"));

        let manifest = manifest.lock().unwrap();
        assert_eq!(manifest.get_collection("Matematicas"), Some(entry.clone()));
        let index_path = manifest.resolve_path(&entry.files.index);
        let checksums = entry.checksums.clone().unwrap();
        assert_eq!(checksums.index, Some(compute_checksum(&index_path).unwrap()));
        assert_eq!(entry.size_bytes.index, fs::metadata(&index_path).unwrap().len());
    }

    #[tokio::test]
    async fn missing_or_empty_subject_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("data/Lengua")).unwrap();

        let embedder = Arc::new(FakeEmbedder::default());
        let (ingestor, manifest) = ingestor(root.path(), embedder.clone());

        assert_eq!(ingestor.create_index("Historia", None).await.unwrap(), IngestOutcome::NoDocuments);
        assert_eq!(ingestor.create_index("Lengua", None).await.unwrap(), IngestOutcome::NoDocuments);
        assert_eq!(embedder.calls(), 0);
        assert!(manifest.lock().unwrap().subjects().is_empty());
    }

    #[tokio::test]
    async fn default_version_is_utc_date() {
        let root = tempfile::tempdir().unwrap();
        let subject_dir = root.path().join("data/Fisica");
        fs::create_dir_all(&subject_dir).unwrap();
        fs::write(subject_dir.join("fuerzas.txt"), "F = m a").unwrap();

        let (ingestor, _) = ingestor(root.path(), Arc::new(FakeEmbedder::default()));
        let IngestOutcome::Indexed(entry) = ingestor.create_index("Fisica", None).await.unwrap() else {
            panic!("expected an index");
        };
        let parts: Vec<&str> = entry.version.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 4);
    }

    #[tokio::test]
    async fn batch_continues_after_failures() {
        let root = tempfile::tempdir().unwrap();
        let subject_dir = root.path().join("data/Filosofia");
        fs::create_dir_all(&subject_dir).unwrap();
        fs::write(subject_dir.join("ser.txt"), "¿Qué es el ser?").unwrap();

        let embedder = Arc::new(FakeEmbedder::failing_on("ser"));
        let (ingestor, _) = ingestor(root.path(), embedder);
        let subjects = vec!["Filosofia".to_string(), "Ingles".to_string()];
        let results = ingestor.create_indexes_for_subjects(&subjects, None).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_err());
        assert!(matches!(results[1].1, Ok(IngestOutcome::NoDocuments)));
    }
}
