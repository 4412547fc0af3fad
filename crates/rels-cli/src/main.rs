use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rels_core::SearchRequest;
use rels_pipeline::{report_runs_markdown, run_search, PipelineConfig, RunStatus};
use rels_storage::RunStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rels-cli")]
#[command(about = "Real estate listing search command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one search and store its output under the runs directory.
    Search {
        /// Free-text request, e.g. "2BR apartment under $2000 in 90210".
        #[arg(long, conflicts_with = "input", required_unless_present = "input")]
        request: Option<String>,
        /// JSON input document with `realEstateRequest` and optional `OPENAI_API_KEY`.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Reasoning-service key for this run only.
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Serve the read-only run viewer.
    Serve,
    /// Print a markdown summary of recent runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_request(request: Option<String>, input: Option<PathBuf>, api_key: Option<String>) -> Result<SearchRequest> {
    let mut search = match (request, input) {
        (Some(text), _) => SearchRequest::new(text, None),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        (None, None) => bail!("either --request or --input is required"),
    };
    if api_key.is_some() {
        search.api_key = api_key;
    }
    Ok(search)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Search {
            request,
            input,
            api_key,
        } => {
            let search = load_request(request, input, api_key)?;
            let config = PipelineConfig::from_env();
            let summary = run_search(&config, search).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.status == RunStatus::Failed {
                let reason = summary.error.map(|e| e.error).unwrap_or_default();
                bail!("search run {} failed: {reason}", summary.run_id);
            }
        }
        Commands::Serve => {
            rels_web::serve_from_env().await?;
        }
        Commands::Runs { limit } => {
            let config = PipelineConfig::from_env();
            let markdown = report_runs_markdown(&RunStore::new(config.runs_dir), limit)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
