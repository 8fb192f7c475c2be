//! esg-service: submit, inspect and execute long-running tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use esg_service::config::ServiceConfig;
use esg_service::protocol::{ProtocolResponse, TaskProtocol};
use esg_service::service::TaskService;
use esg_service::{linear, logging};

/// Asynchronous task service for forecasting and optimization workloads
#[derive(Parser)]
#[command(name = "esg-service")]
#[command(about = "Submit, inspect and execute long-running tasks", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file. Environment variables override it.
    #[arg(long, short, global = true, env = "ESG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and print its id
    Submit {
        /// Task kind: request or fit-parameters
        kind: String,

        /// JSON payload
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// File containing the JSON payload
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },

    /// Print the status of a task
    Status {
        /// Task identifier
        task_id: String,
    },

    /// Print the result of a finished task
    Result {
        /// Task identifier
        task_id: String,
    },

    /// Execute queued tasks
    ///
    /// Runs until interrupted, or processes a single message with --once.
    Worker {
        /// Process at most one message, then exit
        #[arg(long)]
        once: bool,

        /// Before starting, requeue deliveries claimed more than this many
        /// seconds ago by workers that never acknowledged them
        #[arg(long)]
        recover_after: Option<u64>,
    },

    /// Delete expired tasks
    ///
    /// Sweeps periodically until interrupted, or once with --once.
    Gc {
        /// Run a single sweep, then exit
        #[arg(long)]
        once: bool,
    },

    /// Run a worker and the garbage collector in one process
    Run,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    logging::init(&config.logging.level);
    execute_command(cli.command, config).await
}

fn load_config(path: Option<&std::path::Path>) -> Result<ServiceConfig> {
    let config = match path {
        Some(path) => ServiceConfig::load(path)?.with_env_overrides(std::env::vars())?,
        None => ServiceConfig::from_env()?,
    };
    Ok(config)
}

async fn execute_command(command: Commands, config: ServiceConfig) -> Result<()> {
    if let Commands::Config = command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let service = TaskService::from_config(config).await?;
    let api = TaskProtocol::new(service.dispatcher(), service.reader());

    match command {
        Commands::Submit {
            kind,
            payload,
            payload_file,
        } => {
            let payload = read_payload(payload, payload_file)?;
            print_response(api.submit(&kind, payload).await)
        }
        Commands::Status { task_id } => print_response(api.status(&task_id).await),
        Commands::Result { task_id } => print_response(api.result(&task_id).await),
        Commands::Worker {
            once,
            recover_after,
        } => {
            if let Some(secs) = recover_after {
                service.recover_unacked(Duration::from_secs(secs)).await?;
            }
            let worker = service.worker(linear::computations());
            if once {
                match worker.process_next().await? {
                    Some(outcome) => println!("{outcome:?}"),
                    None => println!("queue empty"),
                }
                return Ok(());
            }
            let shutdown = shutdown_on_ctrl_c();
            worker.run(shutdown).await;
            Ok(())
        }
        Commands::Gc { once } => {
            let gc = service.garbage_collector()?;
            if once {
                let report = gc.sweep().await?;
                println!(
                    "scanned {} collected {} stuck {} reclaimed {} errors {}",
                    report.scanned,
                    report.collected,
                    report.stuck.len(),
                    report.reclaimed,
                    report.errors
                );
                return Ok(());
            }
            gc.run(shutdown_on_ctrl_c()).await;
            Ok(())
        }
        Commands::Run => {
            let shutdown = shutdown_on_ctrl_c();
            let gc = service.garbage_collector()?.spawn(shutdown.clone());
            service
                .worker(linear::computations())
                .run(shutdown)
                .await;
            gc.await.context("garbage collector task failed")?;
            Ok(())
        }
        Commands::Config => Ok(()),
    }
}

fn read_payload(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    let text = match (inline, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read payload file {}", path.display()))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    serde_json::from_str(&text).context("payload is not valid JSON")
}

fn print_response(response: ProtocolResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    if !response.is_success() {
        anyhow::bail!("request failed with status {}", response.status);
    }
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, draining");
                trigger.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
        }
    });
    token
}
