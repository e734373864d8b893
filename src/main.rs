//! wsrelay CLI - WebSocket to TCP line relay.
//!
//! This is the main binary entry point. See the `wsrelay` library for the
//! relay itself.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use wsrelay::{Config, HelperConfig, RelayServer, Supervisor, Target, VERSION};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "wsrelay")]
#[command(version = VERSION)]
#[command(about = "Relay WebSocket sessions to newline-delimited TCP services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Path to a JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listen address (e.g. 0.0.0.0:8080)
        #[arg(long)]
        listen: Option<String>,
        /// Fixed relay target (host:port)
        #[arg(long, conflicts_with = "encoded_targets")]
        target: Option<String>,
        /// Decode the target from each request path instead of using a fixed one
        #[arg(long)]
        encoded_targets: bool,
        /// Companion program to keep running
        #[arg(long)]
        helper: Option<String>,
        /// Argument for the companion program (repeatable)
        #[arg(long = "helper-arg", requires = "helper", allow_hyphen_values = true)]
        helper_args: Vec<String>,
    },
    /// Print the effective configuration as JSON
    ShowConfig {
        /// Path to a JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the request path segment that selects a target
    EncodeTarget {
        /// Target address (host:port)
        target: String,
    },
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("WSRELAY_LOG_FILE") {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            target,
            encoded_targets,
            helper,
            helper_args,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(target) = target {
                config.target = Some(target);
            }
            if encoded_targets {
                config.target = None;
            }
            if let Some(program) = helper {
                config.helper = Some(HelperConfig::new(program, helper_args));
            }
            config.validate()?;
            serve(config).await
        }
        Commands::ShowConfig { config } => {
            let config = Config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::EncodeTarget { target } => {
            let target = Target::parse(&target).with_context(|| format!("Invalid target: {target}"))?;
            println!("/{}", target.encode());
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let server = RelayServer::bind(&config).await?;

    let helper = config.helper.clone().map(|helper| {
        let token = shutdown.clone();
        tokio::spawn(Supervisor::new(helper).run(token))
    });

    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    log::info!("[Server] wsrelay {} ready to accept connections", VERSION);
    let result = server.run(shutdown.clone()).await;

    shutdown.cancel();
    signals.abort();
    if let Some(helper) = helper {
        let _ = helper.await;
    }
    result
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("[Server] Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    log::info!("[Server] Shutdown signal received");
    shutdown.cancel();
}
