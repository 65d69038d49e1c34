use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use teams_core::{TeamsConfig, ToolGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Newline-delimited JSON-RPC on stdin/stdout; the OAuth callback is served on --port
    Stdio,
    /// JSON-RPC over HTTP POST /mcp alongside the OAuth callback
    #[value(name = "streamable-http")]
    StreamableHttp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stdio => "stdio",
            Transport::StreamableHttp => "streamable-http",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "teams_mcp")]
#[command(about = "MCP server for Microsoft Teams via Microsoft Graph")]
#[command(version)]
#[command(after_help = "Examples:
  teams_mcp                                   stdio, all tool groups
  teams_mcp --transport streamable-http       HTTP on port 8000
  teams_mcp --tools chats --tools users       only chat and user tools
  teams_mcp --single-user                     use whichever stored credential exists")]
pub struct Cli {
    /// How MCP clients connect
    #[arg(long, value_enum, default_value_t = Transport::Stdio)]
    pub transport: Transport,

    /// Port for the HTTP listener (OAuth callback and, for streamable-http, /mcp)
    #[arg(long)]
    pub port: Option<u16>,

    /// Skip per-session binding and act for the single stored identity
    #[arg(long)]
    pub single_user: bool,

    /// Tool groups to expose: teams, chats, users, search (default: all)
    #[arg(long = "tools", value_name = "GROUP", num_args = 1.., value_parser = parse_group)]
    pub tools: Vec<ToolGroup>,

    /// TOML configuration file
    #[arg(long, env = "TEAMS_MCP_CONFIG")]
    pub config: Option<PathBuf>,
}

fn parse_group(s: &str) -> Result<ToolGroup, String> {
    s.parse()
}

impl Cli {
    /// CLI flags take precedence over file and environment settings.
    pub fn apply(&self, config: &mut TeamsConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.single_user {
            config.single_user = true;
        }
    }
}
