mod cli;

use clap::Parser;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use teams_core::{
    http,
    mcp_server::{JsonRpcHandler, McpServer},
    transport::StdioTransport,
    AppContext, TeamsConfig, ToolGroup,
};

use crate::cli::{Cli, Transport};

const DEFAULT_LOG_FILTER: &str = "teams_mcp=info,teams_core=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the protocol in stdio mode.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = TeamsConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    log_startup(&config, &cli);

    let enabled: BTreeSet<ToolGroup> = cli.tools.iter().copied().collect();
    let ctx = Arc::new(AppContext::new(config, enabled)?);
    let groups: Vec<&str> = ctx.enabled_tools.iter().map(|g| g.as_str()).collect();
    info!(tool_groups = ?groups, "Tool groups enabled");

    let server = McpServer::new(Arc::clone(&ctx))?;
    let handler = Arc::new(JsonRpcHandler::new(server));
    let host = ctx.config.server.host.clone();
    let port = ctx.config.server.port;

    match cli.transport {
        Transport::Stdio => {
            // The browser redirect still needs somewhere to land.
            let router = http::router(Arc::clone(&handler), cli.transport.as_str(), false);
            tokio::spawn(async move {
                if let Err(e) = http::serve(router, &host, port).await {
                    error!("OAuth callback server stopped: {}", e);
                }
            });

            let transport = StdioTransport::new(handler);
            info!("MCP Server ready, listening on stdio");
            if let Err(e) = transport.run().await {
                error!("Transport error: {}", e);
                return Err(e.into());
            }
        }
        Transport::StreamableHttp => {
            let router = http::router(handler, cli.transport.as_str(), true);
            info!("MCP Server ready on http://{}:{}/mcp", host, port);
            tokio::select! {
                result = http::serve(router, &host, port) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
    }

    Ok(())
}

fn log_startup(config: &TeamsConfig, cli: &Cli) {
    info!(
        transport = cli.transport.as_str(),
        port = config.server.port,
        single_user = config.single_user,
        tenant = %config.oauth.tenant_id,
        redirect_uri = %config.redirect_uri(),
        credentials_dir = %config.storage.credentials_dir.display(),
        "Starting Microsoft Teams MCP server"
    );
    if !config.oauth.is_configured() {
        warn!(
            "Microsoft OAuth client credentials are not configured; set MICROSOFT_OAUTH_CLIENT_ID and MICROSOFT_OAUTH_CLIENT_SECRET. Sign-in will fail until they are."
        );
    }
    if config.session.allow_recent_auth {
        warn!(
            window_secs = config.session.recent_auth_window_secs,
            "Recent-authentication fallback is enabled; unbound sessions may use a just-authenticated identity"
        );
    }
}
