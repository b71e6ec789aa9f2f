//! crmgate MCP server binary.
//!
//! ```bash
//! # Config from ./crmgate.toml or config/crmgate.toml, overridden by CRMGATE_* variables
//! crmgate-mcp
//!
//! # Explicit config file
//! crmgate-mcp --config /etc/crmgate/crmgate.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crmgate_core::config::{AppConfig, LoadOptions};
use crmgate_mcp::bootstrap::{bootstrap, init_logging, spawn_maintenance};
use crmgate_mcp::CrmMcpServer;
use rmcp::ServiceExt;
use tracing::{info, warn};

const MAINTENANCE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Parser)]
#[command(name = "crmgate-mcp", version, about = "CRM tool server for AI agents over MCP stdio")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let require_file = args.config.is_some();
    let config = AppConfig::load(LoadOptions { config_path: args.config, require_file, ..LoadOptions::default() })?;
    init_logging(&config.logging);

    let app = bootstrap(config).await?;
    let maintenance = spawn_maintenance(app.service.clone(), Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    let server = CrmMcpServer::new(app.service.clone(), app.session.clone());

    info!(event_name = "system.server.started", session_id = %app.session.session_id, "serving MCP over stdio");
    let running = server.serve(rmcp::transport::stdio()).await?;
    let reason = running.waiting().await?;
    info!(event_name = "system.server.stopping", reason = ?reason, "MCP connection closed");

    maintenance.abort();
    if let Err(error) = app.service.end_session(&app.session).await {
        warn!(event_name = "session.end_failed", error = %error, "could not release session counters");
    }
    Ok(())
}
