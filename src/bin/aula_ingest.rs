//! Builds per-subject vector indexes from the documents under the data root.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use clap::Parser;

use aula_backend::core::config::{AppPaths, ConfigService};
use aula_backend::core::logging;
use aula_backend::embedding::{Embedder, LlamaEmbedder};
use aula_backend::index::{CollectionManifest, IndexIngestor, IngestOutcome};

#[derive(Parser, Debug)]
#[command(name = "aula-ingest")]
#[command(about = "Build vector indexes per subject")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct IngestArgs {
    /// Subject folders inside the data directory.
    #[arg(required = true)]
    subjects: Vec<String>,

    /// Root directory with subject folders.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Where to store the index artifacts.
    #[arg(long)]
    embeddings_root: Option<PathBuf>,

    /// Manifest path for index metadata.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Version label for the generated indexes; defaults to today's date.
    #[arg(long)]
    index_version: Option<String>,

    /// GGUF embedding model, overriding the configured one.
    #[arg(long, env = "AULA_EMBEDDING_MODEL_PATH")]
    embedding_model: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = IngestArgs::parse();

    let paths = Arc::new(AppPaths::new());
    logging::init_with_file(&paths, "ingest.log");
    let mut settings = ConfigService::new(paths.clone())
        .load()
        .context("Failed to load configuration")?;

    if let Some(path) = args.data_root {
        settings.index.data_root = path;
    }
    if let Some(path) = args.embeddings_root {
        settings.index.embeddings_root = path;
    }
    if let Some(path) = args.manifest {
        settings.index.manifest_path = path;
    }
    if let Some(path) = args.embedding_model {
        settings.embedding.model_path = Some(path);
    }

    let embedder: Arc<dyn Embedder> = Arc::new(
        LlamaEmbedder::start(
            &settings.embedding,
            settings.llm.server_path.as_deref(),
            &paths.project_root,
        )
        .await
        .context("Failed to start the embedding model")?,
    );
    let manifest = CollectionManifest::open(&settings.index.manifest_path, &settings.index.schema_version)
        .context("Failed to open the index manifest")?;
    let ingestor = IndexIngestor::new(
        &settings.index.data_root,
        &settings.index.embeddings_root,
        settings.ingest,
        settings.embedding.batch_size,
        embedder,
        Arc::new(Mutex::new(manifest)),
    );

    let results = ingestor
        .create_indexes_for_subjects(&args.subjects, args.index_version.as_deref())
        .await;

    let mut failed = 0;
    for (subject, result) in results {
        match result {
            Ok(IngestOutcome::Indexed(entry)) => {
                println!("{}: {} vectors (version {})", subject, entry.vectors, entry.version)
            }
            Ok(IngestOutcome::NoDocuments) => println!("{}: no documents", subject),
            Err(err) => {
                failed += 1;
                eprintln!("Failed to create index for '{}': {}", subject, err);
            }
        }
    }

    if failed > 0 {
        bail!("{} subject(s) failed", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_valid() {
        IngestArgs::command().debug_assert();
    }

    #[test]
    fn parses_subjects_and_index_version() {
        let args =
            IngestArgs::try_parse_from(["aula-ingest", "Matematicas", "--index-version", "2024.01"])
                .unwrap();
        assert_eq!(args.subjects, vec!["Matematicas".to_string()]);
        assert_eq!(args.index_version.as_deref(), Some("2024.01"));
        assert!(args.data_root.is_none());
    }

    #[test]
    fn path_overrides_are_parsed() {
        let args = IngestArgs::try_parse_from([
            "aula-ingest",
            "Matematicas",
            "Historia",
            "--data-root",
            "/srv/data",
            "--embeddings-root",
            "/srv/embeddings",
            "--manifest",
            "/srv/manifest.json",
        ])
        .unwrap();
        assert_eq!(args.subjects.len(), 2);
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/data")));
        assert_eq!(args.embeddings_root, Some(PathBuf::from("/srv/embeddings")));
        assert_eq!(args.manifest, Some(PathBuf::from("/srv/manifest.json")));
    }

    #[test]
    fn subjects_are_required() {
        assert!(IngestArgs::try_parse_from(["aula-ingest"]).is_err());
    }

    #[test]
    fn version_flag_reports_the_package_version() {
        let err = IngestArgs::try_parse_from(["aula-ingest", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
