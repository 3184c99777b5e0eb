//! DataQ command-line interface
//!
//! Runs the worker against the configured queue and CAS, and exposes the
//! operator actions around it: seeding, transforms, inspection and recovery.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dataq_logging::{init_logging, LogConfig};
use dataq_queue::TaskStatus;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "dataq", version, about = "Pluggable data extraction pipeline")]
struct Cli {
    /// Configuration file (default: <DATAQ_HOME>/config.yaml)
    #[arg(short, long, global = true, env = "DATAQ_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Process tasks until interrupted
    Run {
        /// Stop once the queue is drained and nothing is in flight
        #[arg(long)]
        until_idle: bool,

        /// Print worker events to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Process exactly one pending task
    Step,

    /// Queue the initial task for one plugin, or for every enabled plugin
    Seed {
        #[arg(short, long)]
        plugin: Option<String>,
    },

    /// Queue a transform of stored content
    Transform {
        #[arg(short, long)]
        plugin: String,

        /// Content hash of a stored item
        #[arg(long)]
        hash: String,
    },

    /// List tasks
    Tasks {
        /// Only tasks with this status (pending, processing, complete, failed)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show task counts per status
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fail tasks left in processing by a worker that died
    Recover,

    /// Inspect the content-addressed store
    Cas {
        #[command(subcommand)]
        action: CasAction,
    },
}

#[derive(Subcommand, Debug)]
enum CasAction {
    /// List stored hashes
    Ls,
    /// Print stored content
    Cat {
        hash: String,
        /// Decode a stored item and print only its payload
        #[arg(long)]
        raw: bool,
    },
    /// Store a file and print its hash
    Put { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        app_name: "dataq",
        verbose: cli.verbose,
    }) {
        eprintln!("warning: logging disabled: {:#}", e);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(dataq_logging::config_file);

    if let Commands::Init { force } = cli.command {
        return cli::config::init(&config_path, force);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let ctx = cli::context::Context::open(&config_path).await?;
        let result = match cli.command {
            Commands::Init { .. } => Ok(()),
            Commands::Run { until_idle, events } => cli::run::run(&ctx, until_idle, events).await,
            Commands::Step => cli::run::step(&ctx).await,
            Commands::Seed { plugin } => cli::tasks::seed(&ctx, plugin.as_deref()).await,
            Commands::Transform { plugin, hash } => {
                cli::tasks::transform(&ctx, &plugin, &hash).await
            }
            Commands::Tasks { status, json } => cli::tasks::list(&ctx, status, json).await,
            Commands::Stats { json } => cli::tasks::stats(&ctx, json).await,
            Commands::Recover => cli::tasks::recover(&ctx).await,
            Commands::Cas { action } => match action {
                CasAction::Ls => cli::cas::ls(&ctx).await,
                CasAction::Cat { hash, raw } => cli::cas::cat(&ctx, &hash, raw).await,
                CasAction::Put { file } => cli::cas::put(&ctx, &file).await,
            },
        };
        ctx.close().await;
        result
    })
}
