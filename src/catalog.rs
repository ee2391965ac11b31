use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

/// Separator between server name and tool name in a tool id.
const TOOL_ID_SEP: &str = "::";

/// Maximum length of a catalog short description.
const SHORT_DESCRIPTION_LEN: usize = 100;

/// Derived risk level for a tool, inferred from its name and description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskHint {
    Low,
    Medium,
    High,
    Unknown,
}

impl RiskHint {
    /// Ordering used by the `risk_max` search filter: low < medium < high < unknown.
    pub fn rank(self) -> u8 {
        match self {
            RiskHint::Low => 1,
            RiskHint::Medium => 2,
            RiskHint::High => 3,
            RiskHint::Unknown => 4,
        }
    }
}

/// Connection state of a downstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Online,
    Offline,
    Connecting,
    Error,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Online => "online",
            ServerState::Offline => "offline",
            ServerState::Connecting => "connecting",
            ServerState::Error => "error",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool entry in the catalog, linking a tool to the server that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Canonical id: `{server}::{tool}`.
    pub tool_id: String,
    pub server_name: String,
    pub tool_name: String,
    /// Full description from the server's tool definition.
    pub description: String,
    /// Display description, at most 100 chars, `...`-suffixed when cut.
    pub short_description: String,
    /// The full JSON schema for the tool's input. Opaque to the gateway.
    pub input_schema: Value,
    /// Deduplicated, sorted tag set. Always contains the server name.
    pub tags: Vec<String>,
    pub risk_hint: RiskHint,
}

/// Point-in-time status snapshot for one downstream server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub status: ServerState,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub last_connected_at: Option<f64>,
    pub last_activity_at: Option<f64>,
    pub pending_request_count: usize,
    pub avg_response_time_ms: f64,
}

/// Join a server and tool name into a catalog tool id.
pub fn make_tool_id(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_ID_SEP}{tool}")
}

/// Split a tool id back into (server, tool). The server half never contains
/// the separator, so the first occurrence is authoritative.
pub fn parse_tool_id(tool_id: &str) -> Option<(&str, &str)> {
    tool_id.split_once(TOOL_ID_SEP)
}

/// Infer a risk level from a tool's name and description.
///
/// High-risk keywords win over low-risk ones on a tie.
pub fn infer_risk_hint(tool_name: &str, description: &str) -> RiskHint {
    const HIGH_RISK: &[&str] = &[
        "delete", "remove", "drop", "execute", "run", "write", "create", "update", "modify",
        "send", "post", "put",
    ];
    const LOW_RISK: &[&str] = &["read", "get", "list", "search", "query", "fetch", "describe"];

    let combined = format!("{tool_name} {description}").to_lowercase();

    if HIGH_RISK.iter().any(|p| combined.contains(p)) {
        return RiskHint::High;
    }
    if LOW_RISK.iter().any(|p| combined.contains(p)) {
        return RiskHint::Low;
    }
    RiskHint::Medium
}

/// Extract category tags from a tool's name and description.
///
/// The server name is always part of the tag set.
pub fn extract_tags(server_name: &str, tool_name: &str, description: &str) -> Vec<String> {
    const CATEGORIES: &[(&str, &[&str])] = &[
        ("database", &["db", "sql", "query", "table", "database"]),
        ("file", &["file", "directory", "folder", "path"]),
        ("git", &["git", "commit", "branch", "repository", "repo"]),
        ("http", &["http", "api", "request", "fetch", "url"]),
        ("search", &["search", "find", "grep", "filter"]),
        ("code", &["code", "function", "class", "symbol"]),
    ];

    let combined = format!("{tool_name} {description}").to_lowercase();

    let mut tags: std::collections::BTreeSet<String> =
        std::iter::once(server_name.to_string()).collect();
    for (category, keywords) in CATEGORIES {
        if keywords.iter().any(|k| combined.contains(k)) {
            tags.insert((*category).to_string());
        }
    }

    tags.into_iter().collect()
}

/// Truncate a description for catalog display, `...`-suffixed when cut.
pub fn truncate_description(description: &str, max_length: usize) -> String {
    if description.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = description.chars().collect();
    if chars.len() <= max_length {
        return description.to_string();
    }
    let mut out: String = chars[..max_length.saturating_sub(3)].iter().collect();
    out.push_str("...");
    out
}

/// Generate a fresh catalog revision identifier.
///
/// Opaque to clients; they compare for equality only.
pub fn generate_revision_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();
    format!("rev-{}-{}", unix_millis(), suffix)
}

/// Current wall time as unix seconds.
pub fn unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// In-memory tool index shared by the manager and the gateway operations.
///
/// DashMap keeps reads lock-free while connectors index tools concurrently
/// with catalog searches.
pub struct ToolCatalog {
    /// tool_id -> ToolInfo
    tools: DashMap<String, ToolInfo>,
    revision: Mutex<String>,
    last_refresh_ts: Mutex<f64>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            revision: Mutex::new(generate_revision_id()),
            last_refresh_ts: Mutex::new(unix_secs()),
        }
    }

    /// Build a `ToolInfo` from a raw `tools/list` entry and install it.
    pub fn index_tool(&self, server_name: &str, tool_name: &str, description: &str, schema: Value) {
        let tool_id = make_tool_id(server_name, tool_name);
        let info = ToolInfo {
            tool_id: tool_id.clone(),
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            description: description.to_string(),
            short_description: truncate_description(description, SHORT_DESCRIPTION_LEN),
            input_schema: schema,
            tags: extract_tags(server_name, tool_name, description),
            risk_hint: infer_risk_hint(tool_name, description),
        };
        self.tools.insert(tool_id, info);
    }

    pub fn get(&self, tool_id: &str) -> Option<ToolInfo> {
        self.tools.get(tool_id).map(|r| r.value().clone())
    }

    pub fn all_tools(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|r| r.value().clone()).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Remove every tool owned by a server.
    pub fn remove_server_tools(&self, server_name: &str) {
        self.tools.retain(|_, info| info.server_name != server_name);
    }

    pub fn clear(&self) {
        self.tools.clear();
    }

    /// Regenerate the revision and stamp the refresh time. Called after every
    /// completed connect_all/refresh/adopt, even partially failed ones.
    pub fn bump_revision(&self) {
        let mut rev = self.revision.lock().unwrap_or_else(|e| e.into_inner());
        *rev = generate_revision_id();
        let mut ts = self
            .last_refresh_ts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *ts = unix_secs();
    }

    /// (revision_id, last_refresh_ts)
    pub fn meta(&self) -> (String, f64) {
        let rev = self.revision.lock().unwrap_or_else(|e| e.into_inner());
        let ts = self
            .last_refresh_ts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        (rev.clone(), *ts)
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}
