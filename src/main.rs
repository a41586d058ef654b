//! arcproxy - routing proxy for federated archive requests

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use arcproxy::app::Runtime;
use arcproxy::config::Config;
use arcproxy::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "arcproxy", version, about = "Routing proxy for federated archive requests")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.listen
    #[arg(long)]
    listen: Option<String>,

    /// Primary upstream node, overrides upstream.address
    #[arg(long)]
    address: Option<String>,

    /// Request state file, overrides state_file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Serve waveform requests from the local archive only
    #[arg(long)]
    local_only: bool,

    /// Send every request to the primary upstream node
    #[arg(long)]
    disable_routing: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    gen_config: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .or_else(|| config.log.level.parse().ok())
            .unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("cannot install logger: {}", e)))?;

    if args.config.is_none() {
        info!("No config file specified, using defaults");
    }
    info!("arcproxy v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(address) = &args.address {
        config.upstream.address = address.clone();
    }
    if let Some(state_file) = &args.state_file {
        config.state_file = Some(state_file.clone());
    }
    if args.local_only {
        config.local.local_only = true;
    }
    if args.disable_routing {
        config.routing.disabled = true;
    }
}
