//! image-distributor - node image distribution CLI
//!
//! Drives the reconciliation engine against a file-backed record store.
//!
//! ## Usage
//!
//! ```sh
//! image-distributor [--config <path>] [--json-logs] add <consumer> <image> <provider>
//! image-distributor remove <consumer> <image>
//! image-distributor reconcile <image>
//! image-distributor delete <image>
//! image-distributor list
//! image-distributor run [--interval <duration>]
//! ```
//!
//! `RUST_LOG` controls verbosity (default `info`).

use anyhow::{Context, bail};
use image_distributor::{
    Config, Distributor, FileStore, ImageStore, REQUEUE_INTERVAL, parse_duration,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Config file looked up when `--config` is not given.
const CONFIG_FILE: &str = "config.yaml";

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("image-distributor").join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Add {
        consumer: String,
        image: String,
        provider: String,
    },
    Remove {
        consumer: String,
        image: String,
    },
    Reconcile {
        image: String,
    },
    Delete {
        image: String,
    },
    List,
    Run {
        interval: Duration,
    },
    Version,
    Help,
}

#[derive(Debug)]
struct Options {
    config: PathBuf,
    json_logs: bool,
}

fn parse_args() -> Result<(Options, Command), String> {
    let mut options = Options {
        config: default_config_path(),
        json_logs: false,
    };

    // Global flags may appear anywhere; strip them first.
    let mut args = Vec::new();
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = raw.next().ok_or("--config requires a path")?;
                options.config = PathBuf::from(path);
            }
            "--json-logs" => options.json_logs = true,
            _ => args.push(arg),
        }
    }

    let Some(cmd) = args.first() else {
        return Ok((options, Command::Help));
    };

    let command = match cmd.as_str() {
        "add" => {
            if args.len() < 4 {
                return Err("add requires <consumer> <image> <provider>".to_string());
            }
            Command::Add {
                consumer: args[1].clone(),
                image: args[2].clone(),
                provider: args[3].clone(),
            }
        }
        "remove" => {
            if args.len() < 3 {
                return Err("remove requires <consumer> <image>".to_string());
            }
            Command::Remove {
                consumer: args[1].clone(),
                image: args[2].clone(),
            }
        }
        "reconcile" => {
            if args.len() < 2 {
                return Err("reconcile requires <image>".to_string());
            }
            Command::Reconcile {
                image: args[1].clone(),
            }
        }
        "delete" => {
            if args.len() < 2 {
                return Err("delete requires <image>".to_string());
            }
            Command::Delete {
                image: args[1].clone(),
            }
        }
        "list" => Command::List,
        "run" => {
            let mut interval = REQUEUE_INTERVAL;
            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--interval" | "-i" => {
                        let value = args.get(i + 1).ok_or("--interval requires a duration")?;
                        interval = parse_duration(value).map_err(|e| e.to_string())?;
                        i += 2;
                    }
                    _ => i += 1,
                }
            }
            if interval.is_zero() {
                return Err("--interval must be positive".to_string());
            }
            Command::Run { interval }
        }
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        unknown => return Err(format!("unknown command: {}", unknown)),
    };

    Ok((options, command))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

fn load(options: &Options) -> anyhow::Result<Distributor> {
    let config = Config::load(&options.config)
        .with_context(|| format!("loading {}", options.config.display()))?;
    let root = config
        .state_dir
        .clone()
        .unwrap_or_else(FileStore::default_path);
    let store: Arc<dyn ImageStore> = Arc::new(FileStore::with_path(root)?);
    Ok(Distributor::from_config(&config, store))
}

/// Returns a token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight work");
            child.cancel();
        }
    });
    token
}

async fn cmd_add(
    d: &Distributor,
    consumer: &str,
    image: &str,
    provider: &str,
) -> anyhow::Result<()> {
    let record = d.on_consumer_added(consumer, image, provider).await?;
    println!(
        "{}: {} consumer(s), state {}",
        record.name(),
        record.status.releases.len(),
        display_state(&record)
    );
    Ok(())
}

async fn cmd_remove(d: &Distributor, consumer: &str, image: &str) -> anyhow::Result<()> {
    match d.on_consumer_removed(consumer, image).await? {
        Some(record) => println!(
            "{}: {} consumer(s) left",
            record.name(),
            record.status.releases.len()
        ),
        None => println!("{}: no such image", image),
    }
    Ok(())
}

async fn cmd_reconcile(d: &Distributor, image: &str) -> anyhow::Result<()> {
    let cancel = shutdown_token();
    let outcome = d
        .reconcile(image, &cancel)
        .await
        .with_context(|| format!("reconciling {}", image))?;

    match d.store().get(image).await? {
        Some(record) => println!("{}: {}", image, display_state(&record)),
        None => println!("{}: removed", image),
    }
    if let Some(after) = outcome.requeue_after {
        println!("next check in {}s", after.as_secs());
    }
    Ok(())
}

async fn cmd_delete(d: &Distributor, image: &str) -> anyhow::Result<()> {
    if d.store().get(image).await?.is_none() {
        bail!("node image {} not found", image);
    }
    d.request_deletion(image).await?;
    cmd_reconcile(d, image).await
}

async fn cmd_list(d: &Distributor) -> anyhow::Result<()> {
    let records = d.store().list().await?;
    println!("{:<64} {:<10} {:<18} RELEASES", "NAME", "PROVIDER", "STATE");
    for record in records {
        println!(
            "{:<64} {:<10} {:<18} {}",
            record.name(),
            record.spec.provider,
            display_state(&record),
            record.status.releases.join(",")
        );
    }
    Ok(())
}

async fn cmd_run(d: &Distributor, interval: Duration) -> anyhow::Result<()> {
    let cancel = shutdown_token();
    info!("Reconciling all node images every {}s", interval.as_secs());

    loop {
        let report = d.reconcile_all(&cancel).await?;
        info!(
            "Pass finished: {} ok, {} failed",
            report.succeeded,
            report.failed.len()
        );

        // Wake early when a record asked for it (retention windows, missing sources).
        let wait = report.next_requeue.map_or(interval, |next| next.min(interval));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    Ok(())
}

fn display_state(record: &image_distributor::NodeImage) -> String {
    record
        .state()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn cmd_version() {
    println!("image-distributor {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"image-distributor - node image distribution

USAGE:
    image-distributor [--config <path>] [--json-logs] <command> [args...]

COMMANDS:
    add <consumer> <image> <provider>   Reference an image
    remove <consumer> <image>           Drop a reference
    reconcile <image>                   Run one reconciliation pass
    delete <image>                      Remove an image from every location
    list                                List node images
    run [--interval <duration>]         Reconcile all images periodically
    version                             Print version
    help                                Print this help

OPTIONS:
    -c, --config <path>   Configuration file (default: {})
        --json-logs       Emit logs as JSON

ENVIRONMENT:
    RUST_LOG              Log filter (default: info)"#,
        default_config_path().display()
    );
}

async fn run(options: Options, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
        command => {
            let d = load(&options)?;
            match command {
                Command::Add {
                    consumer,
                    image,
                    provider,
                } => cmd_add(&d, &consumer, &image, &provider).await,
                Command::Remove { consumer, image } => cmd_remove(&d, &consumer, &image).await,
                Command::Reconcile { image } => cmd_reconcile(&d, &image).await,
                Command::Delete { image } => cmd_delete(&d, &image).await,
                Command::List => cmd_list(&d).await,
                Command::Run { interval } => cmd_run(&d, interval).await,
                Command::Version | Command::Help => Ok(()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match parse_args() {
        Ok((options, command)) => {
            init_logging(options.json_logs);
            match run(options, command).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
