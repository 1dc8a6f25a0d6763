use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::error;
use tracing_subscriber::EnvFilter;

use tmg::{Gateway, GatewayConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "tmg", version, about = "Intelligent MCP gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "TMG_CONFIG")]
    config: Option<PathBuf>,

    /// Client-facing transport.
    #[arg(long, value_enum, default_value = "stdio", env = "TMG_TRANSPORT")]
    transport: Transport,

    /// Listen address for the HTTP transport; overrides the config value.
    #[arg(long, env = "TMG_LISTEN")]
    listen: Option<String>,
}

const EXIT_CONFIG: u8 = 1;
const EXIT_STARTUP: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let listen = cli.listen.clone().unwrap_or_else(|| config.listen.clone());

    let gateway = match Gateway::start(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let served = match cli.transport {
        Transport::Stdio => tmg::routers::stdio::serve(Arc::clone(&gateway)).await,
        Transport::Http => tmg::routers::http::serve(Arc::clone(&gateway), &listen).await,
    };

    gateway.shutdown().await;
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

fn load_config(cli: &Cli) -> tmg_wire::GatewayResult<GatewayConfig> {
    match &cli.config {
        Some(path) => GatewayConfig::load(path),
        None => GatewayConfig::from_yaml("{}"),
    }
}
