//! Microsoft Graph permission scopes and the tool groups that need them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const GRAPH_RESOURCE: &str = "https://graph.microsoft.com/";

pub const USER_READ: &str = "https://graph.microsoft.com/User.Read";
pub const USER_READ_ALL: &str = "https://graph.microsoft.com/User.Read.All";
pub const TEAM_READ_BASIC_ALL: &str = "https://graph.microsoft.com/Team.ReadBasic.All";
pub const CHANNEL_READ_BASIC_ALL: &str = "https://graph.microsoft.com/Channel.ReadBasic.All";
pub const CHANNEL_MESSAGE_READ_ALL: &str = "https://graph.microsoft.com/ChannelMessage.Read.All";
pub const CHANNEL_MESSAGE_SEND: &str = "https://graph.microsoft.com/ChannelMessage.Send";
pub const CHAT_READ: &str = "https://graph.microsoft.com/Chat.Read";
pub const CHAT_READ_WRITE: &str = "https://graph.microsoft.com/Chat.ReadWrite";
pub const TEAM_MEMBER_READ_ALL: &str = "https://graph.microsoft.com/TeamMember.Read.All";
pub const DIRECTORY_READ_ALL: &str = "https://graph.microsoft.com/Directory.Read.All";

/// Requested with every authorization so the provider issues a refresh token.
pub const OFFLINE_ACCESS: &str = "offline_access";

pub const BASE_SCOPES: &[&str] = &[USER_READ];

/// Named scope bundles used when resolving a tool's client.
pub fn scope_group(name: &str) -> Option<&'static [&'static str]> {
    let scopes: &'static [&'static str] = match name {
        "teams_read" => &[TEAM_READ_BASIC_ALL],
        "teams_channels" => &[CHANNEL_READ_BASIC_ALL],
        "teams_messages" => &[CHANNEL_MESSAGE_READ_ALL, CHANNEL_MESSAGE_SEND],
        "teams_chat" => &[CHAT_READ, CHAT_READ_WRITE],
        "teams_members" => &[TEAM_MEMBER_READ_ALL],
        "user_read" => &[USER_READ, USER_READ_ALL],
        "search" => &[CHAT_READ, CHANNEL_MESSAGE_READ_ALL],
        _ => return None,
    };
    Some(scopes)
}

/// Families of tools that can be switched on from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolGroup {
    Teams,
    Chats,
    Users,
    Search,
}

impl ToolGroup {
    pub const ALL: [ToolGroup; 4] = [
        ToolGroup::Teams,
        ToolGroup::Chats,
        ToolGroup::Users,
        ToolGroup::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolGroup::Teams => "teams",
            ToolGroup::Chats => "chats",
            ToolGroup::Users => "users",
            ToolGroup::Search => "search",
        }
    }

    pub fn scopes(&self) -> &'static [&'static str] {
        match self {
            ToolGroup::Teams => &[
                TEAM_READ_BASIC_ALL,
                CHANNEL_READ_BASIC_ALL,
                CHANNEL_MESSAGE_READ_ALL,
                CHANNEL_MESSAGE_SEND,
                TEAM_MEMBER_READ_ALL,
            ],
            ToolGroup::Chats => &[CHAT_READ, CHAT_READ_WRITE],
            ToolGroup::Users => &[USER_READ, USER_READ_ALL],
            ToolGroup::Search => &[CHAT_READ, CHANNEL_MESSAGE_READ_ALL],
        }
    }
}

impl fmt::Display for ToolGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teams" => Ok(ToolGroup::Teams),
            "chats" | "chat" => Ok(ToolGroup::Chats),
            "users" | "user" => Ok(ToolGroup::Users),
            "search" => Ok(ToolGroup::Search),
            other => Err(format!(
                "unknown tool group '{}' (expected teams, chats, users or search)",
                other
            )),
        }
    }
}

/// Sorted, deduplicated scopes for the given groups, always including the base scopes.
pub fn resolve<'a>(groups: impl IntoIterator<Item = &'a ToolGroup>) -> Vec<String> {
    let mut set: BTreeSet<String> = BASE_SCOPES.iter().map(|s| s.to_string()).collect();
    for group in groups {
        set.extend(group.scopes().iter().map(|s| s.to_string()));
    }
    set.into_iter().collect()
}

/// Scopes for named groups; unknown names are ignored.
pub fn resolve_named(names: &[&str]) -> BTreeSet<String> {
    names
        .iter()
        .filter_map(|n| scope_group(n))
        .flat_map(|scopes| scopes.iter().map(|s| s.to_string()))
        .collect()
}

/// Strips the Graph resource prefix (`https://graph.microsoft.com/User.Read` -> `User.Read`).
pub fn simplify(scope: &str) -> &str {
    scope.strip_prefix(GRAPH_RESOURCE).unwrap_or(scope)
}

/// Space-joined scope parameter for the authorize and token endpoints.
pub fn scope_param(scopes: &[String]) -> String {
    let mut out: Vec<&str> = scopes.iter().map(|s| simplify(s)).collect();
    if !out.contains(&OFFLINE_ACCESS) {
        out.push(OFFLINE_ACCESS);
    }
    out.join(" ")
}
