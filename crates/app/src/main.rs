use agenda_rag_core::config::{DEFAULT_EMBEDDING_ENDPOINT, DEFAULT_EMBEDDING_MODEL};
use agenda_rag_core::{
    load_documents, CharacterNgramBackend, EmbeddingBackend, EmbeddingClient, IndexBuilder,
    IndexHandle, MistralBackend, PipelineConfig, Retriever, SnapshotStore, VectorStore,
};
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "agenda-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding index generations
    #[arg(long, env = "AGENDA_RAG_STORE", default_value = "data/index_store")]
    store: PathBuf,

    /// Embedding service API key
    #[arg(long, env = "MISTRAL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Embedding service base URL
    #[arg(long, env = "AGENDA_RAG_EMBED_ENDPOINT", default_value = DEFAULT_EMBEDDING_ENDPOINT)]
    endpoint: String,

    /// Embedding model
    #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
    model: String,

    /// Maximum inputs per embedding request
    #[arg(long, default_value = "50")]
    batch_size: usize,

    /// Minimum milliseconds between embedding requests
    #[arg(long, default_value = "1000")]
    request_interval_ms: u64,

    /// Retries for throttled or transient embedding failures
    #[arg(long, default_value = "3")]
    max_retries: usize,

    /// Use the local character n-gram embedder instead of the remote service.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild the index from cleaned event records and publish it.
    Rebuild {
        /// JSON array of event records.
        #[arg(long, default_value = "data/events_clean.json")]
        source: PathBuf,
        /// Maximum characters per chunk.
        #[arg(long, default_value = "500")]
        chunk_size: usize,
        /// Characters shared by adjacent chunks.
        #[arg(long, default_value = "50")]
        chunk_overlap: usize,
    },
    /// Retrieve the chunks closest to a question.
    Search {
        #[arg(long)]
        question: String,
        /// Number of chunks to return.
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Print results as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print size and provenance of the live index.
    Inspect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        store = %cli.store.display(),
        "agenda-rag boot"
    );

    let mut builder = PipelineConfig::builder()
        .store_root(&cli.store)
        .endpoint(&cli.endpoint)
        .model(&cli.model)
        .max_batch_size(cli.batch_size)
        .min_request_interval(Duration::from_millis(cli.request_interval_ms))
        .max_retries(cli.max_retries);
    if let Command::Rebuild {
        chunk_size,
        chunk_overlap,
        ..
    } = &cli.command
    {
        builder = builder.chunk_size(*chunk_size).chunk_overlap(*chunk_overlap);
    }
    if let Command::Search { top_k, .. } = &cli.command {
        builder = builder.top_k(*top_k);
    }
    let config = builder.build()?;

    if cli.offline || matches!(cli.command, Command::Inspect) {
        execute(cli.command, config, CharacterNgramBackend::default()).await
    } else {
        let api_key = cli
            .api_key
            .context("MISTRAL_API_KEY is not set (use --offline for the local embedder)")?;
        let backend = MistralBackend::new(&api_key, &config.embedding)?;
        execute(cli.command, config, backend).await
    }
}

async fn execute<B>(command: Command, config: PipelineConfig, backend: B) -> anyhow::Result<()>
where
    B: EmbeddingBackend + 'static,
{
    let snapshots = SnapshotStore::new(&config.store_root);
    let embedder = Arc::new(EmbeddingClient::new(backend, config.embedding.clone())?);

    match command {
        Command::Rebuild { source, .. } => {
            let report = load_documents(&source)
                .with_context(|| format!("unable to read {}", source.display()))?;
            for skipped in &report.skipped {
                warn!(position = skipped.position, reason = %skipped.reason, "skipped record");
            }

            let builder = IndexBuilder::new(embedder, config.chunking, snapshots)?;
            let outcome = builder.rebuild(&report.documents).await?;

            println!(
                "{} documents, {} chunks (dimension {}) indexed into {} at {}",
                outcome.documents,
                outcome.chunks,
                outcome.dimension,
                outcome.location.display(),
                Utc::now().to_rfc3339()
            );
            if !outcome.empty_documents.is_empty() {
                println!("{} documents had no text", outcome.empty_documents.len());
            }
        }
        Command::Search { question, json, .. } => {
            let store = snapshots.load_current()?;
            if !store.is_empty() && store.model() != embedder.backend().model() {
                warn!(
                    index_model = store.model(),
                    query_model = embedder.backend().model(),
                    "index was built with a different embedding model"
                );
            }

            let retriever = Retriever::new(embedder, IndexHandle::new(store));
            let hits = retriever
                .retrieve(&question, config.retrieval.top_k)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("no matching events found");
            } else {
                println!("question: {question}");
                for (rank, hit) in hits.iter().enumerate() {
                    println!(
                        "[{}] distance={:.4} id={} title={}",
                        rank + 1,
                        hit.score,
                        hit.metadata.id,
                        hit.metadata.title
                    );
                    if let Some(url) = &hit.metadata.url {
                        println!("  url={url}");
                    }
                    if let Some(start) = &hit.metadata.date_start {
                        println!("  date_start={start}");
                    }
                    println!("  page_content:\n{}", hit.page_content);
                }
            }
        }
        Command::Inspect => {
            let Some(location) = snapshots.current_location()? else {
                println!("no index built yet in {}", snapshots.root().display());
                return Ok(());
            };
            let manifest = VectorStore::read_manifest(&location)?;
            println!("location: {}", location.display());
            println!("model: {}", manifest.model);
            if let Some(built_at) = manifest.built_at {
                println!("built_at: {}", built_at.to_rfc3339());
            }
            println!("dimension: {}", manifest.dimension);
            println!("metadata entries: {}", manifest.entries);

            let store = VectorStore::load(&location)?;
            println!("ntotal: {}", store.ntotal());
        }
    }

    Ok(())
}
