use esxi_mcp::{stdio, ApiKeyGate, McpServer};
use esxi_mcp_server::{http, logging, ServerConfig};
use esxi_vsphere::{InfraService, VsphereApi};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stdio,
    Http,
}

#[derive(Parser, Debug)]
#[command(version, about = "MCP server for VMware ESXi / vCenter", long_about = None)]
struct Args {
    /// Configuration file (JSON, or YAML by .yaml/.yml extension)
    #[arg(short, long, env = "MCP_CONFIG_FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "http")]
    transport: Transport,

    /// Overrides the configured HTTP listen address
    #[arg(long)]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    logging::init(&config).map_err(|e| anyhow::anyhow!("initialising logging: {e}"))?;
    tracing::info!(config = ?config.safe(), "Starting {}", esxi_mcp::protocol::SERVER_NAME);

    let api = Arc::new(
        VsphereApi::connect(&config.vsphere())
            .await
            .with_context(|| format!("connecting to {}", config.vcenter_host))?,
    );
    let service = InfraService::connect(api.clone(), config.coordination.clone(), &config.placement())
        .await
        .context("resolving placement defaults")?;

    let gate = ApiKeyGate::new(config.api_key.clone());
    if !gate.is_enabled() {
        tracing::warn!("No API key configured; every request is accepted");
    }
    let server = Arc::new(McpServer::new(Arc::new(service), gate));

    let served = match args.transport {
        Transport::Stdio => tokio::select! {
            r = stdio::serve_stdio(server) => r,
            _ = tokio::signal::ctrl_c() => Ok(()),
        },
        Transport::Http => {
            http::serve(server, &config.http_addr, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
        }
    };

    tracing::info!("Shutting down");
    api.disconnect().await;
    served.context("transport failed")
}
