use std::{
    io::{self, Write},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};
use siphon::{
    collector::{self, Collector, History, Samples},
    config::{self, SourceKind},
    metric::Sample,
};
use tokio::runtime::Builder;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to load source configuration: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Poll(#[from] collector::PollError),
    #[error("Failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a source once and print its samples as JSON lines
    Collect(CollectCommand),
    /// Print the metrics a Prometheus source describes as JSON lines
    Discover(DiscoverCommand),
}

#[derive(Args)]
struct CollectCommand {
    /// path on disk to the source configuration file
    #[clap(long)]
    config_path: PathBuf,
    /// protocol spoken by the source: rest, prometheus or generic
    #[clap(long)]
    kind: SourceKind,
    /// name reported in logs and telemetry, defaults to the source kind
    #[clap(long)]
    name: Option<String>,
}

#[derive(Args)]
struct DiscoverCommand {
    /// path on disk to the Prometheus source configuration file
    #[clap(long)]
    config_path: PathBuf,
}

fn write_line<T: serde::Serialize>(out: &mut impl Write, value: &T) -> Result<(), Error> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn collect(cmd: CollectCommand) -> Result<(), Error> {
    let name = cmd.name.unwrap_or_else(|| cmd.kind.to_string());
    let collector = Collector::load(name, &cmd.config_path, cmd.kind)?;

    let mut history = History::default();
    let poll = collector.collect(&mut history).await?;
    if let Some(errors) = &poll.errors {
        warn!("{errors}");
    }

    let mut out = io::stdout().lock();
    match poll.samples {
        Samples::Ordered(samples) => {
            for sample in samples.iter().flatten() {
                write_line(&mut out, sample)?;
            }
        }
        Samples::Appended(_) => {
            let mut names: Vec<&String> = history.keys().collect();
            names.sort();
            for sample in names.into_iter().flat_map(|n| &history[n]) {
                write_line::<Sample>(&mut out, sample)?;
            }
        }
    }
    info!(
        "{name} is next due in {secs}s",
        name = collector.name(),
        secs = poll
            .next_collection
            .duration_since(poll.captured_at)
            .unwrap_or_default()
            .as_secs(),
    );
    Ok(())
}

async fn discover(cmd: DiscoverCommand) -> Result<(), Error> {
    let collector = Collector::load("discover", &cmd.config_path, SourceKind::Prometheus)?;
    let specs = collector.discover().await;
    if specs.is_empty() {
        warn!("no metrics discovered");
    }

    let mut out = io::stdout().lock();
    for spec in &specs {
        write_line(&mut out, spec)?;
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(io::stderr)
        .finish()
        .init();

    let cli = Cli::parse();

    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        match cli.command {
            Commands::Collect(cmd) => collect(cmd).await,
            Commands::Discover(cmd) => discover(cmd).await,
        }
    })
}
