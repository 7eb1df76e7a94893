use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use prpilot_index::config::VectorBackend;
use prpilot_index::in_memory_store::InMemoryVectorStore;
use prpilot_index::languages::GrammarRegistry;
use prpilot_index::qdrant_ops::QdrantOps;
use prpilot_index::retriever::{changed_chunks, sanitize_collection_name};
use prpilot_index::watcher::IndexWatcher;
use prpilot_index::{
    Config, DependencyGraph, Direction, IndexStore, ReconcileReport, Reconciler, RetrievalMode,
    RetrievalRequest, Retriever, VectorStore,
};
use prpilot_llm::openai::OpenAiEmbedder;

#[derive(Parser)]
#[command(
    name = "prpilot",
    version,
    about = "Incremental code knowledge index for pull request review",
    after_help = r"Examples:
  prpilot index --repo . --watch
  git diff main | tee change.diff && prpilot query --name repo --diff change.diff --mode precise --repo .
  prpilot chain --name repo --chunk <chunk-id> --hops 2 --callers
"
)]
struct Cli {
    /// Config file (defaults to `$PRPILOT_CONFIG`, then `prpilot.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring the index of a repository up to date.
    Index {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Collection name; defaults to the repository directory name.
        #[arg(long)]
        name: Option<String>,
        /// Re-index every file regardless of stored hashes.
        #[arg(long)]
        full: bool,
        /// Keep running and re-index on file changes.
        #[arg(long)]
        watch: bool,
    },
    /// Find indexed code related to a diff.
    Query {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "diff")]
        mode: RetrievalMode,
        #[arg(long)]
        top_k: Option<usize>,
        /// Unified diff file.
        #[arg(long)]
        diff: PathBuf,
        /// Working tree with the post-change sources.
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Walk the call graph from one or more chunks.
    Chain {
        #[arg(long)]
        name: String,
        #[arg(long = "chunk", required = true)]
        chunks: Vec<String>,
        #[arg(long)]
        hops: Option<usize>,
        /// Follow callers instead of callees.
        #[arg(long)]
        callers: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    config.validate()?;

    match cli.command {
        Command::Index {
            repo,
            name,
            full,
            watch,
        } => run_index(&config, &repo, name, full, watch).await,
        Command::Query {
            name,
            mode,
            top_k,
            diff,
            repo,
        } => run_query(&config, &name, mode, top_k, &diff, repo).await,
        Command::Chain {
            name,
            chunks,
            hops,
            callers,
        } => run_chain(&config, &name, &chunks, hops, callers).await,
    }
}

fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("PRPILOT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("prpilot.toml")
}

fn registry(config: &Config) -> Arc<GrammarRegistry> {
    let mut registry = GrammarRegistry::builtin();
    registry.skip_extensions(config.index.skip_extensions.iter().map(String::as_str));
    Arc::new(registry)
}

/// SQLite store and vector backend. The in-memory backend pairs with an
/// in-memory database so the manifest never outlives its vectors.
async fn open_storage(config: &Config) -> anyhow::Result<(IndexStore, Arc<dyn VectorStore>)> {
    match config.storage.vector_backend {
        VectorBackend::Memory => {
            tracing::warn!("in-memory vector backend: index lives only for this process");
            let store = IndexStore::new(":memory:").await?;
            Ok((store, Arc::new(InMemoryVectorStore::new())))
        }
        VectorBackend::Qdrant => {
            let store = IndexStore::new(&config.storage.sqlite_path)
                .await
                .with_context(|| format!("failed to open {}", config.storage.sqlite_path))?;
            let qdrant = QdrantOps::new(&config.storage.qdrant_url)
                .map_err(|e| anyhow!("failed to connect to Qdrant: {e}"))?;
            Ok((store, Arc::new(qdrant)))
        }
    }
}

fn embedder(config: &Config) -> anyhow::Result<Arc<OpenAiEmbedder>> {
    let embedder = OpenAiEmbedder::new(
        config.embedding.api_key.clone(),
        config.embedding.base_url.clone(),
        config.embedding.model.clone(),
    )?
    .with_max_retries(config.index.max_retries);
    Ok(Arc::new(embedder))
}

fn default_collection(root: &Path) -> anyhow::Result<String> {
    let dir = root
        .file_name()
        .and_then(|n| n.to_str())
        .context("cannot derive a collection name from the repository path; pass --name")?;
    Ok(sanitize_collection_name(dir))
}

async fn run_index(
    config: &Config,
    repo: &Path,
    name: Option<String>,
    full: bool,
    watch: bool,
) -> anyhow::Result<()> {
    let root = repo
        .canonicalize()
        .with_context(|| format!("repository not found: {}", repo.display()))?;
    let collection = match name {
        Some(name) => name,
        None => default_collection(&root)?,
    };

    let (store, vectors) = open_storage(config).await?;
    let reconciler = Arc::new(Reconciler::new(
        registry(config),
        store,
        vectors,
        embedder(config)?,
        config.index.clone(),
    ));

    let report = reconciler.reconcile(&root, &collection, full).await?;
    print_report(&collection, &report);

    if watch {
        let _watcher = IndexWatcher::start(&root, Arc::clone(&reconciler), collection)?;
        tracing::info!(root = %root.display(), "watching for changes, Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

fn print_report(collection: &str, report: &ReconcileReport) {
    println!(
        "{collection}: {} added, {} modified, {} deleted, {} unchanged, {} skipped, {} failed",
        report.added,
        report.modified,
        report.deleted,
        report.unchanged,
        report.skipped,
        report.failed
    );
    println!(
        "chunks: {} embedded, {} reused, {} over token limit; {} call edges; {} ms",
        report.chunks_embedded,
        report.chunks_reused,
        report.chunks_oversized,
        report.edges_written,
        report.duration_ms
    );
    if report.model_changed {
        println!("embedding model changed: collection rebuilt");
    }
    for error in &report.errors {
        eprintln!("  {error}");
    }
}

async fn run_query(
    config: &Config,
    collection: &str,
    mode: RetrievalMode,
    top_k: Option<usize>,
    diff: &Path,
    repo: Option<PathBuf>,
) -> anyhow::Result<()> {
    let diff_text = tokio::fs::read_to_string(diff)
        .await
        .with_context(|| format!("failed to read diff {}", diff.display()))?;
    let (store, vectors) = open_storage(config).await?;
    let changed = changed_chunks(&store, collection, &diff_text).await?;
    let changed_ids: Vec<String> = changed.iter().map(|c| c.id.clone()).collect();

    let mut retriever = Retriever::new(registry(config), store.clone(), vectors, embedder(config)?)
        .with_chunker(config.index.chunker())
        .with_max_query_tokens(config.index.max_embed_tokens);
    if let Some(repo) = repo {
        retriever = retriever.with_repo_root(repo);
    }

    let request = RetrievalRequest {
        mode,
        top_k: top_k.unwrap_or(config.retrieval.top_k),
        diff_text,
        changed,
    };
    let results = retriever.retrieve(collection, &request).await?;
    if results.is_empty() {
        println!("no related code found");
        return Ok(());
    }

    for result in &results {
        println!(
            "{:.3}  {}:{}-{}  {} {}",
            result.score,
            result.file_path,
            result.start_line,
            result.end_line,
            result.kind,
            result.name
        );
    }

    let graph = DependencyGraph::load(&store, collection).await?;
    let result_ids: Vec<String> = results.iter().map(|r| r.chunk_id.clone()).collect();
    let chains = graph.dependency_chains(&changed_ids, &result_ids);
    if !chains.is_empty() {
        println!("\ndependency chains:");
        for chain in chains {
            println!("  {chain}");
        }
    }
    Ok(())
}

async fn run_chain(
    config: &Config,
    collection: &str,
    chunks: &[String],
    hops: Option<usize>,
    callers: bool,
) -> anyhow::Result<()> {
    let (store, _) = open_storage(config).await?;
    let graph = DependencyGraph::load(&store, collection).await?;
    let (known, unknown): (Vec<&String>, Vec<&String>) =
        chunks.iter().partition(|id| graph.contains_chunk(id));
    for id in &unknown {
        tracing::warn!(chunk = %id, "chunk not indexed, ignoring");
    }
    if known.is_empty() {
        bail!("none of the given chunks are indexed in {collection}");
    }

    let direction = if callers {
        Direction::Callers
    } else {
        Direction::Callees
    };
    let hops = hops.unwrap_or(config.retrieval.chain_hops);
    for reach in graph.reachable(chunks, hops, direction) {
        let path: Vec<String> = reach.path.iter().map(|id| graph.label(id)).collect();
        println!("{}  {}", reach.hops, path.join(" -> "));
    }
    Ok(())
}
