use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, error, info, warn};

use crate::downstream::DownstreamManager;
use crate::gateway::GatewayTools;
use crate::protocol::{self, IncomingRequest, JSONRPC_VERSION, MCP_PROTOCOL_VERSION};

/// The host-facing MCP server: one dispatcher task reading line-delimited
/// JSON-RPC from the host, answering with the five gateway tools.
///
/// Log output goes to stderr only; stdout carries nothing but frames.
pub struct GatewayServer {
    tools: Arc<GatewayTools>,
    manager: Arc<DownstreamManager>,
}

impl GatewayServer {
    pub fn new(tools: GatewayTools, manager: Arc<DownstreamManager>) -> Self {
        Self {
            tools: Arc::new(tools),
            manager,
        }
    }

    /// Serve until the host closes its end of the stream.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("host transport started");
        let mut lines = BufReader::new(input).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let request: IncomingRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "unparseable frame from host");
                    continue;
                }
            };

            let Some(reply) = self.handle(request).await else {
                continue; // notification
            };
            protocol::write_frame(&mut output, &reply).await?;
        }

        info!("host closed the transport");
        Ok(())
    }

    /// Handle one message. Returns `None` for notifications.
    async fn handle(&self, request: IncomingRequest) -> Option<Value> {
        let id = request.id.clone();

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": self.capability_summary(),
            })),
            "tools/list" => Ok(json!({"tools": gateway_tool_definitions()})),
            "tools/call" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                Ok(self.dispatch_tool(&name, arguments).await)
            }
            method if method.starts_with("notifications/") => return None,
            "ping" => Ok(json!({})),
            other => Err(format!("Method not found: {other}")),
        };

        // Notifications get no reply even on error
        let id = id?;

        Some(match result {
            Ok(result) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }),
            Err(message) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "error": {"code": -32601, "message": message},
            }),
        })
    }

    /// Route a tools/call to the right gateway operation. Handler failures
    /// become an `{error: true, message}` text payload rather than a
    /// transport error.
    async fn dispatch_tool(&self, name: &str, arguments: Value) -> Value {
        debug!(tool = %name, "host tool call");

        let outcome: Result<Value> = match name {
            "gateway.catalog_search" => serde_json::from_value(arguments)
                .map_err(Into::into)
                .map(|input| self.tools.catalog_search(input))
                .and_then(|out| serde_json::to_value(out).map_err(Into::into)),
            "gateway.describe" => match serde_json::from_value(arguments) {
                Ok(input) => self
                    .tools
                    .describe(input)
                    .map_err(Into::into)
                    .and_then(|card| serde_json::to_value(card).map_err(Into::into)),
                Err(e) => Err(e.into()),
            },
            "gateway.invoke" => match serde_json::from_value(arguments) {
                Ok(input) => {
                    let out = self.tools.invoke(input).await;
                    serde_json::to_value(out).map_err(Into::into)
                }
                Err(e) => Err(anyhow::Error::from(e)),
            },
            "gateway.refresh" => match serde_json::from_value(arguments) {
                Ok(input) => {
                    let out = self.tools.refresh(input).await;
                    serde_json::to_value(out).map_err(Into::into)
                }
                Err(e) => Err(anyhow::Error::from(e)),
            },
            "gateway.health" => serde_json::to_value(self.tools.health()).map_err(Into::into),
            other => Err(anyhow::anyhow!("Unknown tool: {other}")),
        };

        match outcome {
            Ok(value) => {
                let text =
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                json!({"content": [{"type": "text", "text": text}]})
            }
            Err(e) => {
                error!(tool = %name, error = %e, "tool execution error");
                let payload = json!({"error": true, "message": e.to_string()});
                json!({"content": [{"type": "text", "text": payload.to_string()}]})
            }
        }
    }

    /// One-paragraph capability summary for the initialize instructions.
    fn capability_summary(&self) -> String {
        let tool_count = self.manager.catalog().tool_count();
        if tool_count == 0 {
            return "MCP Gateway: No tools currently available.\n\
                    Use gateway.refresh to reload server configurations."
                .to_string();
        }
        let server_count = self.manager.server_statuses().len();
        format!(
            "MCP Gateway: {tool_count} tools available from {server_count} servers. \
             Use gateway.catalog_search to discover tools, gateway.describe to inspect \
             one, and gateway.invoke to call it."
        )
    }
}

/// MCP tool definitions for the five gateway operations.
pub fn gateway_tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "gateway.catalog_search",
            "description": "Search for available tools across all connected MCP servers. \
                Returns compact capability cards without full schemas. \
                Use filters to narrow results by server, tags, or risk level.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query to match against tool names, descriptions, and tags"
                    },
                    "filters": {
                        "type": "object",
                        "properties": {
                            "server": {
                                "type": "string",
                                "description": "Filter to tools from a specific server"
                            },
                            "tags": {
                                "type": "array",
                                "items": {"type": "string"},
                                "description": "Filter to tools with any of these tags"
                            },
                            "risk_max": {
                                "type": "string",
                                "enum": ["low", "medium", "high"],
                                "description": "Maximum risk level to include"
                            }
                        }
                    },
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 100,
                        "default": 20,
                        "description": "Maximum number of results to return"
                    },
                    "include_offline": {
                        "type": "boolean",
                        "default": false,
                        "description": "Include tools from offline servers"
                    }
                }
            }
        }),
        json!({
            "name": "gateway.describe",
            "description": "Get detailed information about a specific tool, including its arguments \
                and constraints. Use this before invoking a tool to understand its requirements.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_id": {
                        "type": "string",
                        "description": "The tool ID in format \"server_name::tool_name\""
                    }
                },
                "required": ["tool_id"]
            }
        }),
        json!({
            "name": "gateway.invoke",
            "description": "Invoke a tool on a downstream MCP server. \
                Output is automatically truncated if too large.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tool_id": {
                        "type": "string",
                        "description": "The tool ID in format \"server_name::tool_name\""
                    },
                    "arguments": {
                        "type": "object",
                        "description": "Arguments to pass to the tool (must match tool schema)"
                    },
                    "options": {
                        "type": "object",
                        "properties": {
                            "timeout_ms": {
                                "type": "integer",
                                "minimum": 1000,
                                "maximum": 300000,
                                "default": 30000,
                                "description": "Timeout in milliseconds"
                            },
                            "max_output_chars": {
                                "type": "integer",
                                "minimum": 100,
                                "maximum": 100000,
                                "description": "Maximum output characters (truncated if exceeded)"
                            },
                            "redact_secrets": {
                                "type": "boolean",
                                "default": false,
                                "description": "Redact detected secrets from output"
                            }
                        }
                    }
                },
                "required": ["tool_id"]
            }
        }),
        json!({
            "name": "gateway.refresh",
            "description": "Reload backend MCP server configurations and reconnect. \
                Use this when new MCP servers have been configured or to recover from connection errors.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "source": {
                        "type": "string",
                        "enum": ["claude_config", "custom"],
                        "description": "Config source to reload from"
                    },
                    "reason": {
                        "type": "string",
                        "description": "Reason for refresh (for logging)"
                    }
                }
            }
        }),
        json!({
            "name": "gateway.health",
            "description": "Get the health status of the gateway and all connected MCP servers. \
                Shows server status, tool counts, and last refresh time.",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }),
    ]
}
