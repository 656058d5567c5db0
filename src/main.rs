//! # Resonance CLI (`resonance`)
//!
//! Thin command-line front end over the library: store initialization,
//! pre-flight validation, ingestion, semantic and literal search, and graph
//! analytics.
//!
//! ## Usage
//!
//! ```bash
//! resonance --config ./resonance.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `resonance init` | Create the store and run schema migrations |
//! | `resonance validate` | Run the pre-flight validator and write its report |
//! | `resonance ingest` | Validate, then ingest the corpus |
//! | `resonance search "<query>"` | Semantic search over node embeddings |
//! | `resonance grep "<text>"` | Literal search over the corpus files |
//! | `resonance stats` | Store and graph summary |
//! | `resonance graph <action>` | Graph analytics |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

mod graph_cmd;
mod search;
mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use resonance::config::{self, Config};
use resonance::embedding::{create_embedder, Embedder};
use resonance::ingest::IngestionPipeline;
use resonance::progress::ProgressMode;
use resonance::store::NodeEdgeStore;
use resonance::validate::{CorpusValidator, Severity};

/// Resonance: an embedded knowledge-graph and vector-retrieval engine for
/// documentation corpora.
#[derive(Parser)]
#[command(name = "resonance", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the file does not exist, defaults rooted at the current
    /// directory are used.
    #[arg(long, global = true, default_value = "./resonance.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store file and run schema migrations.
    ///
    /// Idempotent: running it on an up-to-date store changes nothing.
    Init,

    /// Run pre-flight validation and print the report.
    Validate,

    /// Validate, then ingest the corpus.
    Ingest {
        /// Ingest only these files, skipping validation and pruning.
        paths: Vec<PathBuf>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,

        /// Progress output on stderr: off, human, or json.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Semantic search over node embeddings.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Literal search over the corpus files.
    Grep {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Summary of the store contents.
    Stats,

    /// Graph analytics.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },
}

#[derive(Subcommand)]
enum GraphAction {
    /// Size, communities, and the most central nodes.
    Overview {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Distinct nodes adjacent to a node.
    Neighbors { id: String },
    /// Fewest-hop path between two nodes.
    Path { from: String, to: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::for_root(std::env::current_dir()?))
    }
}

fn progress_mode(value: Option<&str>) -> Result<ProgressMode> {
    match value {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => bail!("Unknown progress mode: {}. Use off, human, or json.", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = NodeEdgeStore::open(&cfg).await?;
            store.close().await;
            println!("Store initialized at {}", cfg.db.path.display());
        }
        Commands::Validate => {
            let report = CorpusValidator::new(&cfg)?.run()?;
            println!(
                "files:   {} ({} valid, {} skipped)",
                report.total_files, report.valid_files, report.skipped_files
            );
            println!("size:    {} bytes", report.total_size_bytes);
            println!(
                "issues:  {} errors, {} warnings, {} info",
                report.count(Severity::Error),
                report.count(Severity::Warning),
                report.count(Severity::Info)
            );
            for issue in &report.issues {
                println!("  [{}] {} {}: {}", issue.severity, issue.code, issue.path, issue.details);
            }
            println!("report:  {}", cfg.ingest.report_path.display());
            if report.has_errors {
                bail!("Pre-flight validation failed; ingestion would be blocked");
            }
            println!("ok");
        }
        Commands::Ingest {
            paths,
            json,
            progress,
        } => {
            let store = NodeEdgeStore::open(&cfg).await?;
            let embedder: Arc<dyn Embedder> = create_embedder(&cfg.embedding)?;
            let mut pipeline = IngestionPipeline::new(store.clone(), embedder, &cfg)
                .with_progress(progress_mode(progress.as_deref())?.reporter());

            let report = if paths.is_empty() {
                pipeline.ingest().await
            } else {
                pipeline.ingest_files(&paths).await
            };
            store.close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let s = &report.stats;
                println!("ingest {}", report.state);
                println!("  files: {}", s.files);
                println!("  processed: {}  skipped: {}  failed: {}", s.processed, s.skipped, s.failed);
                println!("  embedded: {}", s.embedded);
                println!("  nodes: {}  edges: {}  vectors: {}", s.nodes, s.edges, s.vectors);
                if s.pruned > 0 || s.rescued > 0 {
                    println!("  pruned: {}  rescued: {}", s.pruned, s.rescued);
                }
                if s.timeline_linked > 0 {
                    println!("  timeline: {} linked", s.timeline_linked);
                }
                if s.super_node_gate.rejected > 0 {
                    println!(
                        "  super-node gate: {} of {} edges rejected",
                        s.super_node_gate.rejected, s.super_node_gate.checked
                    );
                }
                println!("  duration: {:.2}s", s.duration_sec);
                for failure in &report.failures {
                    println!("  failed {} ({}): {}", failure.path, failure.stage, failure.message);
                }
            }

            if !report.success {
                match report.error {
                    Some(e) => bail!("Ingestion {}: {}", report.state, e),
                    None => bail!(
                        "Ingestion {}; see {}",
                        report.state,
                        cfg.ingest.report_path.display()
                    ),
                }
            }
            if !json {
                println!("ok");
            }
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Grep { query, limit } => {
            search::run_grep(&cfg, &query, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Graph { action } => match action {
            GraphAction::Overview { top } => graph_cmd::run_overview(&cfg, top).await?,
            GraphAction::Neighbors { id } => graph_cmd::run_neighbors(&cfg, &id).await?,
            GraphAction::Path { from, to } => graph_cmd::run_path(&cfg, &from, &to).await?,
        },
    }

    Ok(())
}
