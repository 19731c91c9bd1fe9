use std::io::Write;
use std::panic;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::aggregate::{Aggregator, SelectionPolicy};
use crate::cli::{BenchArgs, Cli, Command, ListArgs, ReportArgs, SelectionArgs};
use crate::config::Config;
use crate::core::domain::SourceProgram;
use crate::core::pipeline::bench::Bench;
use crate::core::pipeline::sweep::{self, Selection};
use crate::native::runner::NativeRunner;
use crate::store::Store;

mod aggregate;
mod cli;
mod config;
mod constants;
mod core;
mod discovery;
mod native;
mod store;


#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    match Cli::parse().command {
        Command::Bench(args) => bench(args).await,
        Command::Report(args) => report(args),
        Command::List(args) => list(args),
    }
}

async fn bench(args: BenchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config.config)?;
    let sources = discovery::discover(&args.selection.source_dir)?;
    let selection = selection(&args.selection);
    let episodes = sweep::plan(&config.registry, &sources, &selection);

    let store = Store::open(&args.db.db)?;
    let runner = NativeRunner::new().with_timeout(config.settings.timeout());
    let mut bench = Bench::new(Arc::new(runner), &store);
    if let Some(repetitions) = config.settings.repetitions {
        bench = bench.with_repetitions(repetitions);
    }

    tracing::info!(episodes = episodes.len(), db = %args.db.db.display(), "Starting sweep");
    let summary = sweep::sweep(&bench, &episodes).await?;
    if summary.failed > 0 {
        tracing::warn!(
            failed = summary.failed,
            episodes = summary.episodes,
            "Some episodes were aborted"
        );
    }

    Ok(())
}

fn report(args: ReportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config.config)?;
    let store = Store::open(&args.db.db)?;
    let policy = if args.prefer_passing {
        SelectionPolicy::PreferPassing
    } else {
        SelectionPolicy::Compatible
    };

    let aggregates = Aggregator::new(&store, &config.registry)
        .with_policy(policy)
        .aggregate()?;
    let json = serde_json::to_string_pretty(&aggregates)?;

    match &args.output {
        Some(path) => std::fs::write(path, json + "\n")?,
        None => writeln!(std::io::stdout().lock(), "{json}")?,
    }

    Ok(())
}

fn list(args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config.config)?;
    let sources: Vec<SourceProgram> = discovery::discover(&args.selection.source_dir)?;
    let selection = selection(&args.selection);

    let mut stdout = std::io::stdout().lock();
    for episode in sweep::plan(&config.registry, &sources, &selection) {
        writeln!(
            stdout,
            "{}\t{}\t{}",
            episode.game.name,
            episode.implementation.name,
            episode.source.path.display()
        )?;
    }

    Ok(())
}

fn selection(args: &SelectionArgs) -> Selection {
    Selection {
        games: args.games.clone(),
        implementations: args.implementations.clone(),
        filters: args.filters.clone(),
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
