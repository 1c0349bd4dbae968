use anyhow::{bail, Context};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use pdf_vector_ingest_core::stores::{self, VectorBackend, VectorStoreConfig};
use pdf_vector_ingest_core::{
    ChunkingConfig, EmbedderKind, EmbeddingConfig, LopdfExtractor, Manifest, MetadataFilter,
    NormalizerConfig, Pipeline, PipelineConfig, QueryService, RetryPolicy, RunSummary, Workspace,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-vector-ingest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Args)]
struct Settings {
    /// Root of the pipeline workspace (raw/, extracted/, chunks/, manifest.jsonl, ...).
    #[arg(long, env = "PIPELINE_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// PDF folder, defaults to <data-dir>/raw.
    #[arg(long, env = "PIPELINE_INPUT_DIR", global = true)]
    input_dir: Option<PathBuf>,

    /// `http` for an OpenAI-compatible API, `hashing` for offline runs.
    #[arg(long, env = "EMBEDDER", default_value = "http", global = true)]
    embedder: EmbedderKind,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small", global = true)]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_BASE_URL", default_value = "https://api.openai.com/v1", global = true)]
    embedding_base_url: String,

    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true, global = true)]
    embedding_api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value = "384", global = true)]
    dimensions: usize,

    /// Send `dimensions` with each embedding request; disable for models that reject it.
    #[arg(
        long,
        env = "EMBEDDING_REQUEST_DIMENSIONS",
        default_value_t = true,
        action = ArgAction::Set,
        global = true
    )]
    request_dimensions: bool,

    #[arg(long, default_value = "64", global = true)]
    embed_batch_size: usize,

    /// `pinecone` or `qdrant`.
    #[arg(long, env = "VECTOR_BACKEND", default_value = "pinecone", global = true)]
    backend: VectorBackend,

    #[arg(long, env = "PINECONE_INDEX_NAME", default_value = "legal-index-v1", global = true)]
    index_name: String,

    /// Data-plane host; Pinecone looks it up from the index name when unset.
    #[arg(long, env = "PINECONE_HOST", global = true)]
    host: Option<String>,

    #[arg(long, env = "PINECONE_API_KEY", hide_env_values = true, global = true)]
    vector_api_key: Option<String>,

    #[arg(long, env = "PINECONE_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[arg(long, env = "PINECONE_CLOUD", default_value = "aws", global = true)]
    cloud: String,

    #[arg(long, env = "PINECONE_REGION", default_value = "us-east-1", global = true)]
    region: String,

    #[arg(long, default_value = "100", global = true)]
    upsert_batch_size: usize,

    /// Characters of chunk text stored as vector metadata.
    #[arg(long, default_value = "8000", global = true)]
    metadata_text_chars: usize,

    #[arg(long, default_value = "30", global = true)]
    timeout_secs: u64,

    /// Shared limit for embedding and vector store calls, 0 disables it.
    #[arg(long, env = "REQUESTS_PER_MINUTE", default_value = "0", global = true)]
    requests_per_minute: u32,

    #[arg(long, default_value = "3", global = true)]
    max_attempts: u32,

    #[arg(long, default_value = "1", global = true)]
    workers: usize,

    #[arg(long, default_value = "600", global = true)]
    target_tokens: usize,

    #[arg(long, default_value = "800", global = true)]
    max_tokens: usize,

    #[arg(long, default_value = "50", global = true)]
    min_tokens: usize,

    #[arg(long, default_value = "100", global = true)]
    overlap_tokens: usize,
}

impl Settings {
    fn pipeline_config(&self) -> PipelineConfig {
        let timeout = Duration::from_secs(self.timeout_secs);

        PipelineConfig {
            data_dir: self.data_dir.clone(),
            input_dir: self.input_dir.clone(),
            normalizer: NormalizerConfig::default(),
            chunking: ChunkingConfig {
                target_tokens: self.target_tokens,
                max_tokens: self.max_tokens,
                min_tokens: self.min_tokens,
                overlap_tokens: self.overlap_tokens,
                ..ChunkingConfig::default()
            },
            embedder: self.embedder,
            embedding: EmbeddingConfig {
                model: self.embedding_model.clone(),
                base_url: self.embedding_base_url.clone(),
                api_key: self.embedding_api_key.clone(),
                dimensions: self.dimensions,
                request_dimensions: self.request_dimensions,
                batch_size: self.embed_batch_size,
                timeout,
                ..EmbeddingConfig::default()
            },
            store: VectorStoreConfig {
                backend: self.backend,
                index_name: self.index_name.clone(),
                host: self.host.clone(),
                api_key: self.vector_api_key.clone(),
                namespace: self.namespace.clone(),
                cloud: self.cloud.clone(),
                region: self.region.clone(),
                timeout,
                upsert_batch_size: self.upsert_batch_size,
                metadata_text_chars: self.metadata_text_chars,
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            requests_per_minute: self.requests_per_minute,
            workers: self.workers,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run every pending stage for the PDFs in the input folder.
    Ingest {
        /// Create the index or collection first if it does not exist.
        #[arg(long, default_value_t = false)]
        create_index: bool,
    },
    /// Embed a question and print the closest chunks.
    Query {
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
        #[arg(long)]
        document_id: Option<String>,
        #[arg(long)]
        source_file: Option<String>,
    },
    /// Summarize the manifest.
    Status {
        /// Rewrite the manifest with one line per document.
        #[arg(long, default_value_t = false)]
        compact: bool,
    },
    /// Compare the index dimension with the embedder.
    CheckIndex,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-vector-ingest boot"
    );

    match cli.command {
        Command::Ingest { create_index } => {
            let config = cli.settings.pipeline_config();
            config.validate().context("invalid configuration")?;

            if create_index {
                stores::ensure_index(&config.store, config.embedding.dimensions)
                    .await
                    .context("creating vector index")?;
            }

            let store = stores::connect(&config.store)
                .await
                .context("connecting to vector store")?;
            let embedder = config.build_embedder()?;
            let pipeline = Pipeline::new(&config, Arc::new(LopdfExtractor), embedder, store)?;

            let summary = pipeline.run().await?;
            print_summary(&summary);

            let manifest = pipeline.manifest_summary().await;
            println!(
                "manifest: documents={} complete={} in_progress={} skipped={} failed={}",
                manifest.documents,
                manifest.complete,
                manifest.in_progress,
                manifest.skipped,
                manifest.failed
            );
        }
        Command::Query {
            text,
            top_k,
            document_id,
            source_file,
        } => {
            let config = cli.settings.pipeline_config();
            config.validate().context("invalid configuration")?;

            let store = stores::connect(&config.store)
                .await
                .context("connecting to vector store")?;
            let service = QueryService::new(
                config.build_embedder()?,
                store,
                config.retry,
                config.rate_limiter(),
            );
            let filter = MetadataFilter {
                document_id,
                source_file,
            };

            let matches = service.search(&text, top_k, filter).await?;
            println!("query: {text}");
            if matches.is_empty() {
                println!("no matches");
            }
            for (rank, hit) in matches.iter().enumerate() {
                println!("{}. score={:.4} id={}", rank + 1, hit.score, hit.id);
                if let Some(metadata) = &hit.metadata {
                    println!(
                        "   source={} pages={}-{} title={:?}",
                        metadata.source_file, metadata.page_start, metadata.page_end, metadata.title
                    );
                    let excerpt = metadata.text.chars().take(300).collect::<String>();
                    println!("   {}", excerpt.replace('\n', " "));
                }
            }
        }
        Command::Status { compact } => {
            let workspace = Workspace::new(&cli.settings.data_dir, cli.settings.input_dir.clone());
            let mut manifest = Manifest::open(workspace.manifest_path())?;
            if compact {
                manifest.compact()?;
            }

            for entry in manifest.entries() {
                let state = if let Some(failure) = &entry.failure {
                    format!("failed at {}: {}", failure.stage, failure.reason)
                } else if let Some(reason) = &entry.skipped {
                    format!("skipped: {reason}")
                } else if entry.is_complete() {
                    "complete".to_string()
                } else {
                    "in progress".to_string()
                };
                println!(
                    "{} chunks={} vectors={} {}",
                    entry.document_id, entry.chunk_count, entry.indexed_vectors, state
                );
            }

            let summary = manifest.summary();
            println!(
                "documents={} complete={} in_progress={} skipped={} failed={}",
                summary.documents,
                summary.complete,
                summary.in_progress,
                summary.skipped,
                summary.failed
            );
        }
        Command::CheckIndex => {
            let config = cli.settings.pipeline_config();
            config.store.validate().context("invalid vector store configuration")?;

            let store = stores::connect(&config.store)
                .await
                .context("connecting to vector store")?;
            let stats = store.describe().await?;
            println!(
                "backend={} index={} dimension={} vectors={}",
                store.backend(),
                config.store.index_name,
                stats.dimension,
                stats.total_vectors
            );
            if stats.dimension != config.embedding.dimensions {
                bail!(
                    "index dimension {} does not match embedding dimension {}",
                    stats.dimension,
                    config.embedding.dimensions
                );
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} documents: {} indexed, {} unchanged, {} skipped, {} failed",
        summary.total(),
        summary.succeeded.len(),
        summary.unchanged.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    for skipped in &summary.skipped {
        println!("  skipped {}: {}", skipped.document_id, skipped.reason);
    }
    for failed in &summary.failed {
        println!(
            "  failed {} at {}: {}",
            failed.document_id, failed.stage, failed.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_parameter_can_be_turned_off() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from(["pdf-vector-ingest", "status"])?;
        assert!(cli.settings.pipeline_config().embedding.request_dimensions);

        let cli = Cli::try_parse_from([
            "pdf-vector-ingest",
            "--request-dimensions",
            "false",
            "ingest",
        ])?;
        assert!(!cli.settings.pipeline_config().embedding.request_dimensions);
        Ok(())
    }
}
