//! Command-line front end for the sandbox
//!
//! Runs a single request through the same dispatcher the agent uses and prints
//! the result as JSON, which makes it the quickest way to check a host's
//! Docker setup and sandbox image before wiring the library into an agent.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use sandrun_core::{
    config::ConfigLoader, CodeExecutor, Dispatcher, DockerRuntime, ExecutionKind,
    ExecutionMetrics, ExecutionRequest, SandboxConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sandrun - Run untrusted code in a disposable container")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML configuration file (defaults plus SANDRUN_* variables when omitted)")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "Log level: error, warn, info, debug or trace")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute source with the sandbox interpreter
    Code {
        #[clap(help = "Source to run; read from --file or stdin when omitted")]
        source: Option<String>,

        #[clap(long, short, conflicts_with = "source")]
        file: Option<PathBuf>,

        #[clap(long, help = "Allow outbound network access")]
        network: bool,

        #[clap(long, short, help = "Timeout in seconds")]
        timeout: Option<u64>,
    },
    /// Execute a shell command (network enabled)
    Command {
        cmd: String,

        #[clap(long, short, help = "Timeout in seconds")]
        timeout: Option<u64>,
    },
    /// Ping the Docker daemon and verify the sandbox image is present
    Check,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::from_file(path).await?,
        None => ConfigLoader::from_env()?,
    };

    // Initialize logger
    let level = cli.log_level.as_deref().unwrap_or(config.logging.level.as_str());
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let success = match cli.command {
        Commands::Code {
            source,
            file,
            network,
            timeout,
        } => {
            let source = read_source(source, file).await?;
            let kind = if network {
                ExecutionKind::CodeWithNetwork
            } else {
                ExecutionKind::Code
            };
            run_request(config, ExecutionRequest::new(kind, source), timeout).await?
        }
        Commands::Command { cmd, timeout } => {
            run_request(config, ExecutionRequest::command(cmd), timeout).await?
        }
        Commands::Check => check(&config).await?,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            true
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn read_source(source: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(source) = source {
        return Ok(source);
    }
    if let Some(path) = file {
        return tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read source file {}", path.display()));
    }

    let mut source = String::new();
    tokio::io::stdin()
        .read_to_string(&mut source)
        .await
        .context("Failed to read source from stdin")?;
    Ok(source)
}

async fn run_request(
    config: SandboxConfig,
    mut request: ExecutionRequest,
    timeout: Option<u64>,
) -> Result<bool> {
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let metrics = Arc::new(ExecutionMetrics::new());
    let dispatcher = Dispatcher::connect(config, metrics.clone())?;
    let result = dispatcher.execute(request).await;

    log::debug!("Metrics: {:?}", metrics.snapshot());
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

async fn check(config: &SandboxConfig) -> Result<bool> {
    let runtime = DockerRuntime::connect(&config.daemon)?;

    let version = runtime.ping().await?;
    println!("Docker daemon reachable (engine {})", version);

    match runtime.verify_image(&config.image.reference).await {
        Ok(()) => {
            println!("Sandbox image {} is present", config.image.reference);
            Ok(true)
        }
        Err(e) => {
            log::error!("{}", e);
            println!("Sandbox image {} is missing", config.image.reference);
            Ok(false)
        }
    }
}
