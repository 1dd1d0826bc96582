//! CLI entry point for the AIFF drop-folder daemon
//!
//! `run` keeps the watcher and worker alive until Ctrl-C; the other commands
//! act once, let the worker drain the queue and exit.

use aiff_drop_daemon::config::FolderSettings;
use aiff_drop_daemon::{init_logging, Config, Daemon};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound for one-shot commands waiting on the queue.
const DRAIN_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// AIFF Drop Daemon - convert audio files dropped into a folder to AIFF
#[derive(Parser, Debug)]
#[command(name = "aiff-drop-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the drop folder and convert files until interrupted (default)
    Run,
    /// Register audio files already in the watch folder and convert new ones
    Scan,
    /// Convert one registered download now
    Convert {
        /// Download id as shown by `downloads`
        download_id: i64,
    },
    /// Retry a failed conversion
    Retry {
        job_id: i64,
    },
    /// Print the service status as JSON
    Status,
    /// Print recent conversion jobs as JSON
    Jobs {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print recently detected downloads as JSON
    Downloads {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Change folder settings and save them to the config file
    Configure {
        #[arg(long)]
        watch: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        auto_convert: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let _guard = init_logging(&config.logging.directory, &config.logging.level)
        .context("initializing logging")?;

    let daemon = Daemon::open(config)
        .context("opening job store")?
        .with_config_path(&args.config);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_service(&daemon).await?,
        Command::Scan => {
            let summary = daemon.scan_now().await?;
            print_json(&summary)?;
            drain(&daemon).await;
        }
        Command::Convert { download_id } => {
            let job_id = daemon.convert_download(download_id).await?;
            println!("{}", json!({ "job_id": job_id }));
            drain(&daemon).await;
            print_json(&daemon.store().get(job_id)?)?;
        }
        Command::Retry { job_id } => {
            daemon.retry(job_id).await?;
            drain(&daemon).await;
            print_json(&daemon.store().get(job_id)?)?;
        }
        Command::Status => println!("{}", daemon.status()?.to_json_pretty()?),
        Command::Jobs { limit } => print_json(&daemon.list_jobs(limit)?)?,
        Command::Downloads { limit } => print_json(&daemon.list_downloads(limit)?)?,
        Command::Configure {
            watch,
            output,
            auto_convert,
        } => {
            if watch.is_none() && output.is_none() && auto_convert.is_none() {
                bail!("nothing to change; pass --watch, --output or --auto-convert");
            }
            let current = daemon.settings();
            let settings = FolderSettings {
                watch_folder: watch.or(current.watch_folder),
                output_folder: output.or(current.output_folder),
                auto_convert: auto_convert.unwrap_or(current.auto_convert),
            };
            daemon.apply_settings(settings).await?;
            print_json(&daemon.settings())?;
        }
    }

    daemon.shutdown().await;
    Ok(())
}

async fn run_service(daemon: &Daemon) -> Result<()> {
    info!(
        watch = ?daemon.settings().watch_folder,
        output = ?daemon.settings().output_folder,
        "AIFF drop daemon starting"
    );
    daemon.restore_on_startup().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutdown requested, finishing current conversion");
    Ok(())
}

/// Let the worker process everything queued so far.
async fn drain(daemon: &Daemon) {
    if !daemon.worker().is_running() {
        if daemon.worker().queue_size() > 0 {
            warn!(
                queued = daemon.worker().queue_size(),
                "Worker not running; queued jobs stay pending"
            );
        }
        return;
    }
    if !daemon.drain(DRAIN_LIMIT).await {
        warn!("Gave up waiting for the conversion queue");
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
