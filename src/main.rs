//! quarry: local code index with hybrid lexical and semantic search.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quarry_core::Config;
use quarry_index::{
    Engine, IndexWatcher, ProjectStatus, ReindexReport, SearchMode, SearchRequest, format_hits,
};

#[derive(Parser)]
#[command(name = "quarry", version)]
#[command(about = "Local code index with hybrid BM25 and vector search")]
struct Cli {
    /// Config file (default: $QUARRY_CONFIG, then <config dir>/quarry/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a project, re-embedding only what changed
    Index {
        /// Project root (default: current directory)
        path: Option<PathBuf>,
        /// Fail instead of waiting when the project is already being indexed
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        json: bool,
    },
    /// Search an indexed project
    Search {
        query: String,
        /// Project root (default: current directory)
        #[arg(short, long)]
        project: Option<PathBuf>,
        /// lexical, dense or hybrid
        #[arg(short, long)]
        mode: Option<SearchMode>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(long)]
        bm25_weight: Option<f32>,
        #[arg(long)]
        dense_weight: Option<f32>,
        /// Disable the declared-name boost
        #[arg(long)]
        no_entity: bool,
        #[arg(long)]
        rerank: bool,
        #[arg(long)]
        json: bool,
    },
    /// Make another embedding model active for a project
    SwitchModel {
        model: String,
        #[arg(short, long)]
        project: Option<PathBuf>,
    },
    /// Index, then keep the index current as files change
    Watch {
        path: Option<PathBuf>,
    },
    /// Show index status of a project
    Status {
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List indexed projects
    Projects,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = quarry_core::resolve_config_path(cli.config.as_deref());
    let config = quarry_core::load_config(&config_path)?;
    init_subscriber(&config);
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    let engine = Arc::new(quarry_core::build_engine(&config)?);
    match cli.command {
        Command::Index {
            path,
            no_wait,
            json,
        } => {
            let root = project_root(path)?;
            let report = if no_wait {
                engine.try_reindex(&root).await?
            } else {
                engine.reindex(&root).await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&root, &report);
            }
        }
        Command::Search {
            query,
            project,
            mode,
            top_k,
            bm25_weight,
            dense_weight,
            no_entity,
            rerank,
            json,
        } => {
            let root = project_root(project)?;
            let mut request = engine.search_defaults().clone();
            apply_search_flags(
                &mut request,
                SearchFlags {
                    mode,
                    top_k,
                    bm25_weight,
                    dense_weight,
                    no_entity,
                    rerank,
                },
            );
            let hits = engine.search(&root, &query, &request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                print!("{}", format_hits(&hits));
            }
        }
        Command::SwitchModel { model, project } => {
            let root = project_root(project)?;
            let report = engine.switch_model(&root, &model).await?;
            println!(
                "active model: {} (dim {}, {} chunks embedded)",
                report.model, report.dimension, report.embedded
            );
        }
        Command::Watch { path } => {
            let root = project_root(path)?;
            watch(&engine, &root, quarry_core::watch_debounce(&config)).await?;
        }
        Command::Status { path, json } => {
            let root = project_root(path)?;
            let status = engine.status(&root).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Projects => {
            for meta in engine.registry().list()? {
                println!(
                    "{}  {}  {} chunks  {}",
                    meta.project_hash,
                    meta.project_path.display(),
                    meta.chunk_count,
                    meta.embedding_model
                );
            }
        }
    }
    Ok(())
}

struct SearchFlags {
    mode: Option<SearchMode>,
    top_k: Option<usize>,
    bm25_weight: Option<f32>,
    dense_weight: Option<f32>,
    no_entity: bool,
    rerank: bool,
}

fn apply_search_flags(request: &mut SearchRequest, flags: SearchFlags) {
    if let Some(mode) = flags.mode {
        request.mode = mode;
    }
    if let Some(k) = flags.top_k {
        request.top_k = k;
    }
    if let Some(w) = flags.bm25_weight {
        request.bm25_weight = w;
    }
    if let Some(w) = flags.dense_weight {
        request.dense_weight = w;
    }
    if flags.no_entity {
        request.entity_tracking = false;
    }
    if flags.rerank {
        request.rerank = true;
    }
}

fn project_root(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match path {
        Some(p) => Ok(p),
        None => std::env::current_dir().context("failed to resolve current directory"),
    }
}

async fn watch(engine: &Arc<Engine>, root: &Path, debounce: std::time::Duration) -> anyhow::Result<()> {
    let report = engine.reindex(root).await?;
    print_report(root, &report);

    let watcher = IndexWatcher::start(root, Arc::clone(engine), debounce)?;
    tracing::info!(project = %root.display(), "watching for changes, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    watcher.stop().await;
    Ok(())
}

fn print_report(root: &Path, report: &ReindexReport) {
    println!(
        "{}: +{} ~{} -{} ({} unchanged), {} chunks embedded, {} reused, {} failed, v{} in {}ms",
        root.display(),
        report.added,
        report.modified,
        report.deleted,
        report.unchanged,
        report.embedded,
        report.chunks_reused,
        report.failed_files,
        report.version,
        report.duration_ms
    );
}

fn print_status(status: &ProjectStatus) {
    let meta = &status.metadata;
    println!("project:   {}", meta.project_path.display());
    println!("hash:      {}", meta.project_hash);
    println!("model:     {} (dim {})", meta.embedding_model, meta.model_dimension);
    println!("stores:    {}", meta.models.join(", "));
    println!("files:     {}", status.files);
    println!("chunks:    {}", status.chunks);
    println!("version:   {}", status.version);
    println!("updated:   {}", meta.updated_at.to_rfc3339());
    if status.busy {
        println!("state:     indexing");
    }
    if !status.recovered_files.is_empty() {
        println!(
            "recovered: {} files from an interrupted run",
            status.recovered_files.len()
        );
    }
}

fn init_subscriber(config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = config.log.file.as_ref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "quarry", "search", "parse config", "-m", "lexical", "-k", "3", "--no-entity",
        ])
        .unwrap();
        let Command::Search {
            mode,
            top_k,
            no_entity,
            rerank,
            bm25_weight,
            dense_weight,
            ..
        } = cli.command
        else {
            panic!("expected search command");
        };

        let mut request = SearchRequest::default();
        apply_search_flags(
            &mut request,
            SearchFlags {
                mode,
                top_k,
                bm25_weight,
                dense_weight,
                no_entity,
                rerank,
            },
        );
        assert_eq!(request.mode, SearchMode::Lexical);
        assert_eq!(request.top_k, 3);
        assert!(!request.entity_tracking);
        assert!(!request.rerank);
        assert!((request.bm25_weight - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn global_config_flag_parses_after_subcommand() {
        let cli = Cli::try_parse_from(["quarry", "status", "--config", "/tmp/q.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/q.toml")));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["quarry", "search", "x", "--mode", "fuzzy"]).is_err());
    }
}
