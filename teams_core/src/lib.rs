// src/lib.rs
pub mod auth_flow;
pub mod auth_store;
pub mod config;
pub mod connectors;
pub mod context;
pub mod credentials;
pub mod error;
pub mod format;
pub mod graph;
pub mod http;
pub mod mcp_server;
pub mod oauth;
pub mod oauth_state;
pub mod scopes;
pub mod service_cache;
pub mod session_store;
pub mod transport;
pub mod utils;

// Re-export types from rmcp that users of the library need
pub use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, InitializeRequestParam,
    InitializeResult, JsonObject, ListToolsResult, ProtocolVersion, ServerCapabilities, Tool,
};

pub use crate::config::TeamsConfig;
pub use crate::context::{AppContext, GraphServices, ToolContext};
pub use crate::error::TeamsError;
pub use crate::scopes::ToolGroup;

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// A family of MCP tools backed by Microsoft Graph.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unique name of the connector.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Tool group that switches this connector on.
    fn group(&self) -> ToolGroup;

    fn list_tools(&self) -> Result<Vec<Tool>, TeamsError>;

    /// Runs `name` with raw JSON arguments. Unknown names yield `ToolNotFound`.
    async fn call_tool(
        &self,
        name: &str,
        args: JsonObject,
        services: &GraphServices,
        ctx: &ToolContext,
    ) -> Result<CallToolResult, TeamsError>;
}

pub struct ServerInfo {
    pub name: String,
    pub description: String,
}

/// Enabled connectors, with tool names routed to their owner.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
    tools: Vec<Tool>,
    routes: HashMap<String, usize>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        ConnectorRegistry {
            connectors: Vec::new(),
            tools: Vec::new(),
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, connector: Box<dyn Connector>) -> Result<(), TeamsError> {
        let index = self.connectors.len();
        for tool in connector.list_tools()? {
            let name = tool.name.to_string();
            if self.routes.insert(name.clone(), index).is_some() {
                return Err(TeamsError::InternalError(format!(
                    "tool {} registered twice",
                    name
                )));
            }
            self.tools.push(tool);
        }
        self.connectors.push(connector);
        Ok(())
    }

    pub fn connector_for(&self, tool: &str) -> Option<&dyn Connector> {
        self.routes
            .get(tool)
            .and_then(|i| self.connectors.get(*i))
            .map(|c| c.as_ref())
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn list_connectors(&self) -> Vec<ServerInfo> {
        self.connectors
            .iter()
            .map(|c| ServerInfo {
                name: c.name().to_string(),
                description: c.description().to_string(),
            })
            .collect()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry holding the Teams connectors for the enabled tool groups.
pub fn build_registry(groups: &BTreeSet<ToolGroup>) -> Result<ConnectorRegistry, TeamsError> {
    use connectors::teams::{ChannelsConnector, ChatsConnector, SearchConnector, UsersConnector};

    let mut registry = ConnectorRegistry::new();
    for group in groups {
        let connector: Box<dyn Connector> = match group {
            ToolGroup::Teams => Box::new(ChannelsConnector::new()),
            ToolGroup::Chats => Box::new(ChatsConnector::new()),
            ToolGroup::Users => Box::new(UsersConnector::new()),
            ToolGroup::Search => Box::new(SearchConnector::new()),
        };
        registry.register(connector)?;
    }
    Ok(registry)
}
