//! chainpipe CLI: run and inspect the ingestion supervisor.
//!
//! # Commands
//! ```text
//! chainpipe run    [--config chainpipe.yaml]
//! chainpipe check  [--config chainpipe.yaml]
//! chainpipe decode --chain-type evm --file log.json
//! chainpipe info
//! ```

use anyhow::{Context, Result};
use chainpipe_core::RawRecord;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

mod bootstrap;
mod cmd_check;
mod config;
mod health;

use config::AppConfig;

#[derive(Parser)]
#[command(
    name = "chainpipe",
    about = "Blockchain ingestion supervisor (chainpipe CLI)",
    long_about = "
chainpipe: keep one worker per registered source, decode what each chain
emits into normalized events and publish them to a durable bus.

ENVIRONMENT VARIABLES:
  CHAINPIPE_CONFIG   Bootstrap config file (same as --config)
  RUST_LOG           Overrides the configured log filter
",
    version
)]
struct Cli {
    /// Bootstrap config file (YAML). Defaults apply when omitted.
    #[arg(short, long, global = true, env = "CHAINPIPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor until SIGINT / SIGTERM
    Run,

    /// Validate the config, probe every backend and every source definition
    Check,

    /// Decode one captured raw record and print the normalized event
    Decode {
        /// Chain type whose decoder to use, e.g. evm
        #[arg(long)]
        chain_type: String,
        /// File holding the raw record payload
        #[arg(long)]
        file: PathBuf,
        /// Source id stamped on the event
        #[arg(long, default_value = "cli")]
        source_id: String,
    },

    /// Show built-in decoders, connectors and backends
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(cli.config).await,
        Commands::Check => cmd_check::run(cli.config.as_deref()).await,
        Commands::Decode {
            chain_type,
            file,
            source_id,
        } => cmd_decode(&chain_type, &file, &source_id),
        Commands::Info => cmd_info(),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config_path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(config_path.as_deref())?;
    chainpipe_observability::init_tracing(&config.logging).context("initialising logging")?;

    let pipeline = bootstrap::pipeline(&config).await?;
    let shutdown = chainpipe_runtime::cancel_on_signal();

    let health = match config.health.listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding health endpoint on {addr}"))?;
            Some(tokio::spawn(health::serve(
                listener,
                pipeline.supervisor.handle(),
                shutdown.clone(),
            )))
        }
        None => None,
    };

    info!(version = env!("CARGO_PKG_VERSION"), bus = pipeline.bus.name(), "chainpipe starting");
    let result = pipeline.supervisor.run(shutdown.clone()).await;
    // A supervisor that failed at startup still has to release the endpoint.
    shutdown.cancel();
    if let Some(server) = health {
        if let Ok(Err(e)) = server.await {
            tracing::warn!(error = %e, "health endpoint failed");
        }
    }
    result.context("pipeline failed to start")?;
    info!("chainpipe stopped");
    Ok(())
}

fn cmd_decode(chain_type: &str, file: &std::path::Path, source_id: &str) -> Result<()> {
    let payload = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let raw = RawRecord::new(payload);
    let event = bootstrap::decoders()
        .decode(source_id, chain_type, &raw)
        .with_context(|| format!("decoding {} as {chain_type}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

fn cmd_info() -> Result<()> {
    let config = AppConfig::default();
    let decoders = bootstrap::decoders();
    let connectors = bootstrap::connectors(&config);

    println!("chainpipe v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Decoders:");
    for chain_type in decoders.chain_types() {
        println!("  ✓ {chain_type}");
    }
    println!();
    println!("Connectors:");
    for chain_type in connectors.chain_types() {
        println!("  ✓ {chain_type}");
    }
    if connectors.has_fallback() {
        println!("  ✓ *  (JSON lines over WebSocket)");
    }
    println!();
    println!("Backends:");
    println!("  registry:     directory (one JSON/YAML file per source)");
    println!("  bus:          memory, jsonl{}", if cfg!(feature = "kafka") { ", kafka" } else { "" });
    println!("  cache:        memory{}", if cfg!(feature = "sqlite") { ", sqlite" } else { "" });
    println!("  checkpoints:  memory, file{}", if cfg!(feature = "sqlite") { ", sqlite" } else { "" });
    println!();
    println!("Defaults:");
    let sup = config.supervisor_config();
    println!(
        "  restarts:     {} per {}s before a source is failed",
        sup.restart.max_restarts,
        sup.restart.window.as_secs()
    );
    println!(
        "  checkpoints:  every {} records or {}s",
        sup.worker.checkpoint.every_records,
        sup.worker.checkpoint.every.as_secs()
    );
    println!("  buffer:       {} events per source", config.publisher.buffer_capacity);
    println!("  dedup ttl:    {}h", config.cache.dedup_ttl_secs / 3600);
    Ok(())
}
