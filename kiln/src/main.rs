//! Kiln fires declarative workloads at a Kubernetes control plane and
//! measures how long the control plane takes to reconcile them.
#![deny(missing_docs)]

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use futures::stream::StreamExt;
use kiln::{burner, client::ClusterClient, config::Config};
use kiln_common::telemetry;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OTLP endpoint to export spans to.
    #[arg(long, env = "KILN_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the jobs described by a config file.
    Init(InitOpts),
    /// Delete every namespace left behind by a previous run.
    Destroy(DestroyOpts),
    /// Print the version and exit.
    Version,
}

#[derive(Args, Debug)]
struct InitOpts {
    /// Path to the config file.
    #[arg(short, long, env = "KILN_CONFIG")]
    config: PathBuf,

    /// Run identity. Generated when not given here or in the config.
    #[arg(long, env = "KILN_UUID")]
    uuid: Option<String>,

    /// Extra key=value pairs for the config rendering context. Repeatable.
    #[arg(long = "user-data", value_parser = parse_key_val)]
    user_data: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct DestroyOpts {
    /// Run identity whose namespaces are deleted.
    #[arg(long, env = "KILN_UUID")]
    uuid: String,
}

fn parse_key_val(input: &str) -> Result<(String, String), String> {
    input
        .split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected key=value, got {input}"))
}

/// Outcome of a command, mapped onto the process exit code.
enum CommandResult {
    Success,
    Failure(anyhow::Error),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone()).await?;

    let cancel = CancellationToken::new();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "signal received, cancelling run");
            shutdown.cancel();
        }
    });

    let result = match args.command {
        Command::Init(opts) => init(opts, cancel.clone()).await,
        Command::Destroy(opts) => destroy(opts, cancel.clone()).await,
        Command::Version => {
            println!("kiln {}", env!("CARGO_PKG_VERSION"));
            Ok(CommandResult::Success)
        }
    };

    telemetry::shutdown_tracing();
    signals_handle.close();
    match result {
        Ok(CommandResult::Success) => Ok(()),
        Ok(CommandResult::Failure(err)) => {
            error!(%err, "run failed");
            std::process::exit(1);
        }
        Err(err) => {
            error!(%err, "command failed");
            std::process::exit(1);
        }
    }
}

async fn init(opts: InitOpts, cancel: CancellationToken) -> Result<CommandResult> {
    let config = Config::load(&opts.config, &opts.user_data)?;
    let report = burner::run(config, opts.uuid, cancel).await?;
    if report.passed {
        Ok(CommandResult::Success)
    } else {
        let failed = report
            .summaries
            .iter()
            .filter(|summary| !summary.passed)
            .count();
        Ok(CommandResult::Failure(anyhow!(
            "{failed} of {} jobs failed",
            report.summaries.len()
        )))
    }
}

async fn destroy(opts: DestroyOpts, cancel: CancellationToken) -> Result<CommandResult> {
    let client = kube::Client::try_default().await?;
    let cluster = ClusterClient::try_new(client).await?;
    burner::destroy(&cluster, &opts.uuid, &cancel).await?;
    Ok(CommandResult::Success)
}
