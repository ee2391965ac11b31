use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{RiskHint, ServerState, ToolInfo};
use crate::config;
use crate::downstream::DownstreamManager;
use crate::downstream::error::GatewayError;
use crate::policy::PolicyManager;

/// Bounds on the caller-supplied invoke timeout.
const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Per-argument description cap in a schema card.
const ARG_DESCRIPTION_LEN: usize = 200;

fn default_limit() -> usize {
    20
}

/// `gateway.catalog_search` input.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSearchInput {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_offline: bool,
}

impl Default for CatalogSearchInput {
    fn default() -> Self {
        Self {
            query: None,
            filters: None,
            limit: default_limit(),
            include_offline: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub risk_max: Option<RiskHint>,
}

/// Compact search result: enough to decide whether to `describe` a tool,
/// without the full schema.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityCard {
    pub tool_id: String,
    pub server: String,
    pub tool_name: String,
    pub short_description: String,
    pub tags: Vec<String>,
    pub availability: &'static str,
    pub risk_hint: RiskHint,
}

#[derive(Debug, Serialize)]
pub struct CatalogSearchOutput {
    pub results: Vec<CapabilityCard>,
    pub total_available: usize,
    pub truncated: bool,
}

/// `gateway.describe` input.
#[derive(Debug, Clone, Deserialize)]
pub struct DescribeInput {
    pub tool_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub required: bool,
    pub short_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub examples: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct SchemaCard {
    pub server: String,
    pub tool_name: String,
    pub description: String,
    pub args: Vec<ArgInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_notes: Option<Vec<String>>,
}

/// `gateway.invoke` input.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeInput {
    pub tool_id: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub options: Option<InvokeOptions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvokeOptions {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_output_chars: Option<usize>,
    #[serde(default)]
    pub redact_secrets: bool,
}

#[derive(Debug, Serialize)]
pub struct InvokeOutput {
    pub tool_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub raw_size_estimate: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl InvokeOutput {
    fn failure(tool_id: String, message: String) -> Self {
        Self {
            tool_id,
            ok: false,
            result: None,
            truncated: false,
            summary: None,
            raw_size_estimate: 0,
            errors: Some(vec![message]),
        }
    }
}

/// `gateway.refresh` input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshInput {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshOutput {
    pub ok: bool,
    pub servers_seen: usize,
    pub servers_online: usize,
    pub tools_indexed: usize,
    pub revision_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthInfo {
    pub name: String,
    pub status: ServerState,
    pub tool_count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthOutput {
    pub revision_id: String,
    pub servers: Vec<ServerHealthInfo>,
    pub last_refresh_ts: f64,
}

/// The five host-facing operations, bound to the manager and policy.
pub struct GatewayTools {
    manager: Arc<DownstreamManager>,
    policy: Arc<PolicyManager>,
    project_root: Option<PathBuf>,
    custom_config_path: Option<PathBuf>,
}

impl GatewayTools {
    pub fn new(
        manager: Arc<DownstreamManager>,
        policy: Arc<PolicyManager>,
        project_root: Option<PathBuf>,
        custom_config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            manager,
            policy,
            project_root,
            custom_config_path,
        }
    }

    /// Search the catalog for capability cards.
    ///
    /// Filter order: policy, online (unless opted out), server, tags,
    /// risk ceiling, query substring. `total_available` reports the
    /// unfiltered catalog size.
    pub fn catalog_search(&self, input: CatalogSearchInput) -> CatalogSearchOutput {
        let catalog = self.manager.catalog();
        let mut tools = catalog.all_tools();
        let total_available = tools.len();

        tools.retain(|t| self.policy.is_tool_allowed(&t.tool_id));

        if !input.include_offline {
            tools.retain(|t| self.manager.is_server_online(&t.server_name));
        }

        if let Some(filters) = &input.filters {
            if let Some(server) = &filters.server {
                tools.retain(|t| &t.server_name == server);
            }
            if let Some(tags) = &filters.tags {
                let wanted: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
                tools.retain(|t| {
                    t.tags
                        .iter()
                        .any(|tag| wanted.contains(&tag.to_lowercase()))
                });
            }
            if let Some(risk_max) = filters.risk_max {
                tools.retain(|t| t.risk_hint.rank() <= risk_max.rank());
            }
        }

        if let Some(query) = input.query.as_deref().filter(|q| !q.is_empty()) {
            let query = query.to_lowercase();
            tools.retain(|t| {
                t.tool_name.to_lowercase().contains(&query)
                    || t.short_description.to_lowercase().contains(&query)
                    || t.tags.iter().any(|tag| tag.to_lowercase().contains(&query))
            });
            tools.sort_by_cached_key(|t| {
                let name = t.tool_name.to_lowercase();
                (name != query, !name.starts_with(&query), t.tool_name.clone())
            });
        } else {
            tools.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        }

        let truncated = tools.len() > input.limit;
        tools.truncate(input.limit);

        let results = tools
            .into_iter()
            .map(|t| {
                let online = self.manager.is_server_online(&t.server_name);
                CapabilityCard {
                    tool_id: t.tool_id,
                    server: t.server_name,
                    tool_name: t.tool_name,
                    short_description: t.short_description,
                    tags: t.tags,
                    availability: if online { "online" } else { "offline" },
                    risk_hint: t.risk_hint,
                }
            })
            .collect();

        CatalogSearchOutput {
            results,
            total_available,
            truncated,
        }
    }

    /// Build a schema card for one tool: its argument list extracted from
    /// the input schema, plus safety notes for high-risk tools.
    pub fn describe(&self, input: DescribeInput) -> Result<SchemaCard, GatewayError> {
        let tool = self
            .manager
            .catalog()
            .get(&input.tool_id)
            .ok_or_else(|| GatewayError::UnknownTool(input.tool_id.clone()))?;

        if !self.policy.is_tool_allowed(&input.tool_id) {
            return Err(GatewayError::PolicyBlocked(input.tool_id));
        }

        let args = extract_args(&tool);

        let safety_notes = (tool.risk_hint == RiskHint::High)
            .then(|| vec!["This tool may modify data or have side effects.".to_string()]);

        Ok(SchemaCard {
            server: tool.server_name,
            tool_name: tool.tool_name,
            description: tool.description,
            args,
            safety_notes,
        })
    }

    /// Call a downstream tool. Never raises: every failure becomes an
    /// `ok=false` reply with a single-element error list.
    pub async fn invoke(&self, input: InvokeInput) -> InvokeOutput {
        let tool_id = input.tool_id;

        if self.manager.catalog().get(&tool_id).is_none() {
            return InvokeOutput::failure(tool_id.clone(), format!("unknown tool: {tool_id}"));
        }
        if !self.policy.is_tool_allowed(&tool_id) {
            return InvokeOutput::failure(
                tool_id.clone(),
                format!("tool is not allowed by policy: {tool_id}"),
            );
        }

        let options = input.options.unwrap_or_default();
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        let arguments = if input.arguments.is_null() {
            Value::Object(Default::default())
        } else {
            input.arguments
        };

        match self
            .manager
            .call_tool(&tool_id, arguments, timeout_ms)
            .await
        {
            Ok(result) => {
                // Chars-to-bytes with a rough 4x UTF-8 upper bound; the
                // truncation itself never exceeds the byte budget
                let max_bytes = options.max_output_chars.map(|c| c.saturating_mul(4));
                let processed =
                    self.policy
                        .process_output(&result, options.redact_secrets, max_bytes);
                InvokeOutput {
                    tool_id,
                    ok: true,
                    result: Some(processed.result),
                    truncated: processed.truncated,
                    summary: processed.summary,
                    raw_size_estimate: processed.raw_size,
                    errors: None,
                }
            }
            Err(e) => InvokeOutput::failure(tool_id, e.to_string()),
        }
    }

    /// Reload the resolved config list, filter by policy, reconnect
    /// everything.
    pub async fn refresh(&self, input: RefreshInput) -> RefreshOutput {
        info!(
            source = input.source.as_deref().unwrap_or("default"),
            reason = input.reason.as_deref().unwrap_or("manual refresh"),
            "refresh requested"
        );

        let configs = match config::load_configs(
            self.project_root.as_deref(),
            self.custom_config_path.as_deref(),
        ) {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "refresh failed to load configs");
                return RefreshOutput {
                    ok: false,
                    servers_seen: 0,
                    servers_online: 0,
                    tools_indexed: 0,
                    revision_id: "error".to_string(),
                    errors: Some(vec![e.to_string()]),
                };
            }
        };

        let servers_seen = configs.len();
        let allowed: Vec<_> = configs
            .into_iter()
            .filter(|c| self.policy.is_server_allowed(&c.name))
            .collect();

        let errors = self.manager.refresh(&allowed).await;

        let (revision_id, _) = self.manager.catalog().meta();
        let statuses = self.manager.server_statuses();

        RefreshOutput {
            ok: errors.is_empty(),
            servers_seen,
            servers_online: statuses
                .iter()
                .filter(|s| s.status == ServerState::Online)
                .count(),
            tools_indexed: self.manager.catalog().tool_count(),
            revision_id,
            errors: (!errors.is_empty()).then_some(errors),
        }
    }

    /// Snapshot of the gateway: revision, per-server status, refresh time.
    pub fn health(&self) -> HealthOutput {
        let (revision_id, last_refresh_ts) = self.manager.catalog().meta();
        let servers = self
            .manager
            .server_statuses()
            .into_iter()
            .map(|s| ServerHealthInfo {
                name: s.name,
                status: s.status,
                tool_count: s.tool_count,
            })
            .collect();

        HealthOutput {
            revision_id,
            servers,
            last_refresh_ts,
        }
    }
}

fn extract_args(tool: &ToolInfo) -> Vec<ArgInfo> {
    let properties = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object);
    let required: Vec<&str> = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = properties else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, prop)| {
            let arg_type = match prop.get("type") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "unknown".to_string(),
            };
            let description = prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            ArgInfo {
                name: name.clone(),
                arg_type,
                required: required.contains(&name.as_str()),
                short_description: description.chars().take(ARG_DESCRIPTION_LEN).collect(),
                examples: prop.get("examples").cloned(),
            }
        })
        .collect()
}
