//! # Inkwell RAG CLI (`inkrag`)
//!
//! Indexes a writing project and retrieves cited context for a query.
//!
//! ```bash
//! inkrag --project ./novel index
//! inkrag --project ./novel search "how does Chime resolve the key conflict?" --budget 2000
//! inkrag --project ./novel search "bells" --file Characters/Chime.md --json
//! inkrag --project ./novel status
//! inkrag --project ./novel clean
//! ```
//!
//! Results go to stdout; progress and logs go to stderr. Set `RUST_LOG`
//! (e.g. `RUST_LOG=inkwell_rag=debug`) for more detail.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use inkwell_rag::config::resolve_config;
use inkwell_rag::engine::RagEngine;
use inkwell_rag::progress::{IndexEvent, ProgressMode};
use inkwell_rag_core::models::Scope;

#[derive(Parser)]
#[command(
    name = "inkrag",
    about = "Inkwell RAG: incremental indexing and cited context retrieval for writing projects",
    version
)]
struct Cli {
    /// Project root directory.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Config file (TOML). Defaults to `<project>/.inkwell/rag.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress output on stderr while indexing.
    #[arg(long, global = true, value_enum, default_value_t = ProgressArg::Auto)]
    progress: ProgressArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    /// Human progress if stderr is a terminal, otherwise none.
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the index up to date with the files on disk.
    ///
    /// Unchanged files are skipped. Ctrl-C stops between files and keeps
    /// everything indexed so far.
    Index {
        /// Re-index only these project-relative files.
        #[arg(long = "file")]
        files: Vec<String>,
    },

    /// Retrieve ranked, cited context for a query.
    Search {
        query: String,

        /// Token budget for the returned context.
        #[arg(long)]
        budget: Option<usize>,

        /// Restrict retrieval to these project-relative files.
        #[arg(long = "file")]
        files: Vec<String>,

        /// Print the full retrieval as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Index, then list tracked files and engine counters.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Purge index entries and vectors of excluded files.
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli.project, cli.config.as_deref())?;
    let engine = Arc::new(RagEngine::open(&cli.project, config).await?);
    let progress = cli.progress.mode();

    match cli.command {
        Commands::Index { files } => {
            if files.is_empty() {
                let report = run_index(&engine, progress).await?;
                println!(
                    "Indexed {} files ({} chunks), {} unchanged, {} refreshed, {} removed, {} skipped.",
                    report.indexed,
                    report.chunks_written,
                    report.unchanged,
                    report.refreshed,
                    report.removed,
                    report.skipped
                );
                if report.vector_failures > 0 {
                    println!(
                        "{} files are missing vectors; the next index run retries them.",
                        report.vector_failures
                    );
                }
                if report.cancelled {
                    println!("Cancelled; partial progress was kept.");
                }
            } else {
                for file in &files {
                    let outcome = engine.index_file(file).await?;
                    println!("{}: {}", file, serde_json::to_string(&outcome)?);
                }
            }
        }
        Commands::Search {
            query,
            budget,
            files,
            json,
        } => {
            run_index(&engine, ProgressMode::Off).await?;
            let scope = if files.is_empty() {
                Scope::Project
            } else {
                Scope::Files(files)
            };
            let budget = budget.unwrap_or_else(|| engine.config().retrieval.default_budget());
            let retrieval = engine.retrieve(&query, &scope, budget).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&retrieval)?);
            } else if retrieval.chunks.is_empty() {
                println!("No results.");
            } else {
                if let Some(reason) = &retrieval.degraded_reason {
                    eprintln!("note: keyword-only results: {}", reason);
                }
                println!("{}", retrieval.to_prompt_context());
                eprintln!(
                    "{} chunks, ~{} tokens{}",
                    retrieval.chunks.len(),
                    retrieval.used_tokens,
                    if retrieval.cache_hit { " (cached)" } else { "" }
                );
            }
        }
        Commands::Status { json } => {
            run_index(&engine, progress).await?;
            let stats = engine.stats().await;
            let entries = engine.entries().await;
            if json {
                let value = serde_json::json!({ "stats": stats, "files": entries });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for entry in &entries {
                    println!(
                        "{:<14} {:>4}  {}",
                        entry.status.as_str(),
                        entry.chunk_ids.len(),
                        entry.source_path
                    );
                }
                println!(
                    "{} files, {} chunks, vectors: {}",
                    stats.files, stats.chunks, stats.vector_backend
                );
            }
        }
        Commands::Clean => {
            let report = engine.clean_excluded().await?;
            println!(
                "Removed {} entries and vectors for {} sources.",
                report.entries_removed, report.vector_sources_removed
            );
        }
    }

    Ok(())
}

/// Run a full index in the background, streaming events to the reporter.
async fn run_index(
    engine: &Arc<RagEngine>,
    progress: ProgressMode,
) -> Result<inkwell_rag::engine::IndexReport> {
    let reporter = progress.reporter();
    let mut handle = engine.spawn_index();

    let cancel = handle.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    while let Some(event) = handle.events.recv().await {
        reporter.report(&event);
        if matches!(event, IndexEvent::Finished(_)) {
            break;
        }
    }

    let result = handle.join.await;
    ctrl_c.abort();
    result?
}
