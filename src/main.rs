mod ai;
mod artifacts;
mod browser;
mod config;
mod controller;
mod detail;
mod extract;
mod listing;
mod models;
mod navigator;
mod posted;
mod rotator;
#[cfg(test)]
mod testing;
mod warehouse;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use controller::{JobOutcome, RunController, RunSummary};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "jobcrawl")]
#[command(about = "Crawl job listings and turn postings into structured tables")]
struct Cli {
    /// Config file (default: the per-user config.toml, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override llm.model (deepseek-chat, gpt-4o, api-sonnet, claude-haiku, ...)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search listings, then fetch, extract and load every posting found
    Search {
        /// Job title to search for
        #[arg(short, long)]
        title: String,

        /// Country code from the country table (repeatable)
        #[arg(long = "country", default_value = "PE")]
        countries: Vec<String>,

        /// Only crawl and save the search results
        #[arg(long)]
        search_only: bool,

        /// Number of browser sessions working in parallel
        #[arg(short, long)]
        workers: Option<usize>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Reprocess part of a saved search-results file
    Replay {
        /// jobs_<timestamp>.json written by a previous search
        file: PathBuf,

        /// Index of the first record to process
        #[arg(short, long, default_value = "0")]
        start: usize,

        /// Number of records to process
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Fetch, extract and load a single posting
    Analyze {
        /// Job posting URL
        url: String,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// List configured countries
    Countries,

    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "jobcrawl=debug,info" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Cancel `token` on Ctrl-C, and after `timeout_secs` when given.
fn spawn_cancellers(token: &CancellationToken, timeout_secs: Option<u64>) {
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight work");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout_secs {
        let on_deadline = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(secs, "run deadline reached, cancelling");
            on_deadline.cancel();
        });
    }
}

fn build_controller(config: Config, with_llm: bool, cancel: &CancellationToken) -> Result<RunController> {
    let driver = Arc::new(browser::WebDriverBrowser::new(config.browser.clone()));
    let llm = config.llm.clone();
    let mut controller = RunController::new(Arc::new(config), driver, cancel.clone());

    if with_llm {
        let entry = ai::resolve_model(&llm.model)?;
        let provider = ai::create_provider(entry, Duration::from_secs(llm.timeout_secs))
            .with_context(|| format!("Failed to set up model '{}'", llm.model))?;
        info!(model = entry.name, "completion provider ready");
        let extractor = extract::Extractor::new(provider, llm.max_tokens, cancel.clone());
        controller = controller.with_extractor(Arc::new(extractor));
    }
    Ok(controller)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(model) = cli.model {
        config.llm.model = model;
    }

    match cli.command {
        Commands::Search {
            title,
            countries,
            search_only,
            workers,
            timeout_secs,
        } => {
            if let Some(workers) = workers {
                config.pool.workers = workers;
            }
            let cancel = CancellationToken::new();
            spawn_cancellers(&cancel, timeout_secs);
            let mut controller = build_controller(config, !search_only, &cancel)?;

            println!("Searching '{}' in {}...", title, countries.join(", "));
            let summary = controller.run_search(&title, &countries, search_only).await?;
            print_summary(&summary);
        }

        Commands::Replay {
            file,
            start,
            count,
            workers,
            timeout_secs,
        } => {
            if let Some(workers) = workers {
                config.pool.workers = workers;
            }
            let cancel = CancellationToken::new();
            spawn_cancellers(&cancel, timeout_secs);
            let mut controller = build_controller(config, true, &cancel)?;

            println!("Replaying {} from record {} ({} max)...", file.display(), start, count);
            let summary = controller.run_replay(&file, start, count).await?;
            print_summary(&summary);
        }

        Commands::Analyze { url, timeout_secs } => {
            let cancel = CancellationToken::new();
            spawn_cancellers(&cancel, timeout_secs);
            let mut controller = build_controller(config, true, &cancel)?;

            println!("Analyzing {}...", url);
            let summary = controller.run_single(&url).await?;
            print_summary(&summary);
        }

        Commands::Countries => {
            println!("{:<6} {:<20} {:<12} {:<40}", "CODE", "LOCATION", "GEO ID", "SEARCH URL");
            println!("{}", "-".repeat(80));
            for (code, country) in &config.countries {
                println!(
                    "{:<6} {:<20} {:<12} {:<40}",
                    code,
                    truncate(&country.location, 18),
                    country.geo_id,
                    truncate(&country.base_url, 40)
                );
            }
        }

        Commands::Config => {
            let text = config.to_toml().context("Failed to serialize configuration")?;
            print!("{}", text);
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\nListings: {}", summary.listings);
    if let Some(path) = &summary.listings_path {
        println!("Search results: {}", path.display());
    }
    for (code, reason) in &summary.failed_countries {
        println!("Search failed for {}: {}", code, reason);
    }

    if !summary.outcomes.is_empty() {
        println!("\n{:<8} {:<12} {:<50} {:<30}", "JOB ID", "STATUS", "LINK", "REASON");
        println!("{}", "-".repeat(100));
        for outcome in &summary.outcomes {
            match outcome {
                JobOutcome::Loaded { link, job_id } => {
                    println!("{:<8} {:<12} {:<50}", job_id, "loaded", truncate(link, 48));
                }
                JobOutcome::Skipped { link, stage, reason } => {
                    println!(
                        "{:<8} {:<12} {:<50} {:<30}",
                        "-",
                        format!("{:?}", stage).to_lowercase(),
                        truncate(link, 48),
                        truncate(reason, 30)
                    );
                }
            }
        }
        println!("\nLoaded: {}  Skipped: {}", summary.loaded(), summary.skipped());
    }

    if !summary.warehouse_files.is_empty() {
        println!("\nWarehouse files:");
        for path in &summary.warehouse_files {
            println!("  {}", path.display());
        }
    }
    if summary.interrupted {
        println!("\n(Run interrupted; jobs loaded before the stop were flushed)");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
