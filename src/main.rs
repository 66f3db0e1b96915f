//! connect-relay - CLI Entry Point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use connect_relay::{Config, Server, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "connect-relay")]
#[command(version = VERSION)]
#[command(about = "HTTP CONNECT relay with Basic auth and upstream proxy chaining")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Log as JSON lines
    #[arg(long = "json-log")]
    json_log: bool,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("relay-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load_async(&args.config).await;
    init_logging(
        config
            .as_ref()
            .ok()
            .and_then(|c| c.log_level.as_deref())
            .unwrap_or("info"),
        args.json_log,
    )?;

    info!("connect-relay v{}", VERSION);
    info!("Loading configuration from: {}", args.config.display());

    let mut config = match config {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.inbound.listen = listen;
        if let Err(e) = config.validate() {
            error!("Invalid --listen override: {}", e);
            std::process::exit(1);
        }
    }

    // Test mode
    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("connect_relay={}", level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}
