pub mod child;
pub mod error;
pub mod health;
pub mod pending;
pub mod reader;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{ServerState, ServerStatus, ToolCatalog, parse_tool_id, unix_secs};
use crate::config::ResolvedServerConfig;
use crate::protocol::{self, MCP_PROTOCOL_VERSION, Notification, Request};
use error::GatewayError;
use pending::{CancelOutcome, PendingEntry, PendingTable, ResponseWindow};

/// Timeout applied to the initialize / tools/list handshake requests.
const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Grace period for a reader task to observe its cancellation token.
const READER_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Live mutable state for one downstream server, shared between the manager,
/// its reader task and the health monitor.
///
/// The reader only ever touches this record and the pending table, which
/// keeps the ManagedChild/ServerStatus reference cycle out of the design:
/// everything else indexes the manager's maps by name.
pub struct ServerShared {
    pub name: String,
    status: StdMutex<StatusInner>,
    pub pending: PendingTable,
    pub window: ResponseWindow,
}

struct StatusInner {
    state: ServerState,
    tool_count: usize,
    last_error: Option<String>,
    last_connected_at: Option<f64>,
    last_activity_at: Option<f64>,
}

impl ServerShared {
    pub fn new(name: impl Into<String>, state: ServerState) -> Self {
        Self {
            name: name.into(),
            status: StdMutex::new(StatusInner {
                state,
                tool_count: 0,
                last_error: None,
                last_connected_at: None,
                last_activity_at: None,
            }),
            pending: PendingTable::new(),
            window: ResponseWindow::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.status_lock().state
    }

    pub fn mark_online(&self, tool_count: usize) {
        let mut status = self.status_lock();
        status.state = ServerState::Online;
        status.tool_count = tool_count;
        status.last_error = None;
        status.last_connected_at = Some(unix_secs());
    }

    pub fn mark_error(&self, message: impl Into<String>) {
        let mut status = self.status_lock();
        status.state = ServerState::Error;
        status.last_error = Some(message.into());
    }

    /// Stamp `last_activity_at`. Called by the reader on every line.
    pub fn touch_activity(&self) {
        self.status_lock().last_activity_at = Some(unix_secs());
    }

    pub fn snapshot(&self) -> ServerStatus {
        let status = self.status_lock();
        ServerStatus {
            name: self.name.clone(),
            status: status.state,
            tool_count: status.tool_count,
            last_error: status.last_error.clone(),
            last_connected_at: status.last_connected_at,
            last_activity_at: status.last_activity_at,
            pending_request_count: self.pending.len(),
            avg_response_time_ms: self.window.avg_ms(),
        }
    }

    fn status_lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One managed child: its config, shared state, process handles and tasks.
pub struct ManagedServer {
    /// Resolved config the child was spawned from.
    #[allow(dead_code)]
    pub config: ResolvedServerConfig,
    pub shared: Arc<ServerShared>,
    child: child::ChildHandle,
    cancel: CancellationToken,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    _stderr_task: Option<JoinHandle<()>>,
}

impl ManagedServer {
    pub(crate) async fn child_exit_status(&self) -> Option<std::process::ExitStatus> {
        self.child.exit_status().await
    }
}

/// Manages every downstream server: startup, shutdown, refresh, adoption and
/// tool dispatch. Startup, shutdown and refresh are serialized on a
/// lifecycle lock; dispatch runs concurrently.
pub struct DownstreamManager {
    servers: DashMap<String, Arc<ManagedServer>>,
    statuses: DashMap<String, Arc<ServerShared>>,
    catalog: Arc<ToolCatalog>,
    max_tools_per_server: usize,
    lifecycle: tokio::sync::Mutex<()>,
}

impl DownstreamManager {
    pub fn new(catalog: Arc<ToolCatalog>, max_tools_per_server: usize) -> Arc<Self> {
        Arc::new(Self {
            servers: DashMap::new(),
            statuses: DashMap::new(),
            catalog,
            max_tools_per_server,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    /// Connect to every configured server, collecting per-server errors.
    /// The revision is regenerated even when some servers fail.
    pub async fn connect_all(&self, configs: &[ResolvedServerConfig]) -> Vec<String> {
        let _guard = self.lifecycle.lock().await;
        self.connect_all_inner(configs).await
    }

    async fn connect_all_inner(&self, configs: &[ResolvedServerConfig]) -> Vec<String> {
        let mut errors = Vec::new();

        for config in configs {
            if let Err(e) = self.connect_server(config).await {
                let message = format!("Failed to connect to {}: {e}", config.name);
                error!(server = %config.name, error = %e, "connect failed");
                errors.push(message);
            }
        }

        self.catalog.bump_revision();
        errors
    }

    async fn connect_server(&self, config: &ResolvedServerConfig) -> Result<(), GatewayError> {
        let name = config.name.clone();
        let shared = Arc::new(ServerShared::new(&name, ServerState::Connecting));
        self.statuses.insert(name.clone(), Arc::clone(&shared));

        info!(server = %name, "connecting to downstream server");

        let spawned = match child::spawn(&name, &config.config) {
            Ok(spawned) => spawned,
            Err(e) => {
                shared.mark_error(e.to_string());
                return Err(e);
            }
        };

        let server = self.attach(config.clone(), spawned, Arc::clone(&shared));
        self.servers.insert(name.clone(), Arc::clone(&server));

        match self.handshake_and_index(&server).await {
            Ok(indexed) => {
                shared.mark_online(indexed);
                info!(server = %name, tools = indexed, "connected");
                Ok(())
            }
            Err(e) => {
                shared.mark_error(e.to_string());
                server.cancel.cancel();
                server.child.kill_now().await;
                Err(e)
            }
        }
    }

    /// Wire reader and stderr-drain tasks around a spawned child.
    fn attach(
        &self,
        config: ResolvedServerConfig,
        spawned: child::SpawnedChild,
        shared: Arc<ServerShared>,
    ) -> Arc<ManagedServer> {
        let cancel = CancellationToken::new();
        let reader_task = tokio::spawn(reader::run_reader(
            spawned.stdout,
            Arc::clone(&shared),
            cancel.clone(),
        ));
        let stderr_task = spawned
            .stderr
            .map(|stderr| child::drain_stderr(shared.name.clone(), stderr));

        Arc::new(ManagedServer {
            config,
            shared,
            child: spawned.handle,
            cancel,
            reader_task: StdMutex::new(Some(reader_task)),
            _stderr_task: stderr_task,
        })
    }

    /// Drive the initialize handshake and index the server's tools, up to
    /// the per-server limit.
    async fn handshake_and_index(&self, server: &ManagedServer) -> Result<usize, GatewayError> {
        let name = &server.shared.name;

        self.request(
            server,
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            HANDSHAKE_TIMEOUT_MS,
            "",
        )
        .await?;

        self.notify(server, "notifications/initialized").await?;

        let listed = self
            .request(server, "tools/list", json!({}), HANDSHAKE_TIMEOUT_MS, "")
            .await?;
        let tools = listed
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut indexed = 0;
        for tool in &tools {
            if indexed >= self.max_tools_per_server {
                warn!(
                    server = %name,
                    limit = self.max_tools_per_server,
                    "server has more tools than the per-server limit, truncating"
                );
                break;
            }
            let Some(tool_name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            let description = tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let schema = tool.get("inputSchema").cloned().unwrap_or_else(|| json!({}));
            self.catalog.index_tool(name, tool_name, description, schema);
            indexed += 1;
        }

        Ok(indexed)
    }

    /// Send one request frame and await its response slot.
    ///
    /// The entry is registered before the frame is written so an immediate
    /// response cannot be lost. Timeout removes the entry; the reader is the
    /// only success path.
    async fn request(
        &self,
        server: &ManagedServer,
        method: &str,
        params: Value,
        timeout_ms: u64,
        tool_id: &str,
    ) -> Result<Value, GatewayError> {
        let shared = &server.shared;
        let request_id = shared.pending.next_request_id();

        let (tx, rx) = tokio::sync::oneshot::channel();
        shared
            .pending
            .insert(request_id, PendingEntry::new(tool_id, timeout_ms, tx));

        let frame = Request::new(request_id, method, params);
        {
            let mut stdin = server.child.stdin.lock().await;
            if let Err(e) = protocol::write_frame(&mut *stdin, &frame).await {
                shared.pending.remove(request_id);
                return Err(GatewayError::Disconnect {
                    server: shared.name.clone(),
                    reason: format!("write failed: {e}"),
                });
            }
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::disconnected(&shared.name)),
            Err(_) => {
                shared.pending.remove(request_id);
                Err(GatewayError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn notify(&self, server: &ManagedServer, method: &str) -> Result<(), GatewayError> {
        let frame = Notification::new(method, None);
        let mut stdin = server.child.stdin.lock().await;
        protocol::write_frame(&mut *stdin, &frame)
            .await
            .map_err(|e| GatewayError::Disconnect {
                server: server.shared.name.clone(),
                reason: format!("write failed: {e}"),
            })
    }

    /// Dispatch a tool call to the owning server.
    pub async fn call_tool(
        &self,
        tool_id: &str,
        arguments: Value,
        timeout_ms: u64,
    ) -> Result<Value, GatewayError> {
        let tool = self
            .catalog
            .get(tool_id)
            .ok_or_else(|| GatewayError::UnknownTool(tool_id.to_string()))?;

        let server = self
            .servers
            .get(&tool.server_name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| GatewayError::Disconnect {
                server: tool.server_name.clone(),
                reason: "is not connected".to_string(),
            })?;

        let state = server.shared.state();
        if state != ServerState::Online {
            return Err(GatewayError::Disconnect {
                server: tool.server_name.clone(),
                reason: format!("is {state}"),
            });
        }

        self.request(
            &server,
            "tools/call",
            json!({"name": tool.tool_name, "arguments": arguments}),
            timeout_ms,
            tool_id,
        )
        .await
    }

    /// Cancel one in-flight request. `request_id` is `{server}::{numeric}`.
    ///
    /// The frame already sent to the child is not un-sent; a late response
    /// finds no matching id and is discarded by the reader.
    #[allow(dead_code)]
    pub fn cancel(&self, request_id: &str, force: bool) -> CancelOutcome {
        let Some((server_name, numeric)) = parse_tool_id(request_id) else {
            return CancelOutcome::NotFound;
        };
        let Ok(id) = numeric.parse::<i64>() else {
            return CancelOutcome::NotFound;
        };
        let Some(shared) = self.statuses.get(server_name).map(|r| Arc::clone(r.value())) else {
            return CancelOutcome::NotFound;
        };
        let outcome = shared.pending.cancel_entry(id, request_id, force);
        if outcome == CancelOutcome::Cancelled {
            info!(request_id = %request_id, force, "request cancelled");
        }
        outcome
    }

    /// Tear down every server: cancel readers (1 s grace), fail pending
    /// waiters, terminate children, clear the catalog.
    pub async fn disconnect_all(&self) {
        let _guard = self.lifecycle.lock().await;
        self.disconnect_all_inner().await;
    }

    async fn disconnect_all_inner(&self) {
        let names: Vec<String> = self.servers.iter().map(|r| r.key().clone()).collect();

        for name in names {
            let Some((_, server)) = self.servers.remove(&name) else {
                continue;
            };
            info!(server = %name, "disconnecting");

            server.cancel.cancel();
            let task = server
                .reader_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(task) = task {
                let abort = task.abort_handle();
                if tokio::time::timeout(READER_CANCEL_GRACE, task).await.is_err() {
                    abort.abort();
                }
            }

            server
                .shared
                .pending
                .fail_all(|| GatewayError::disconnected(&name));

            server.child.terminate(&name).await;
        }

        self.servers.clear();
        self.statuses.clear();
        self.catalog.clear();
    }

    /// Disconnect everything, then reconnect from the given configs.
    pub async fn refresh(&self, configs: &[ResolvedServerConfig]) -> Vec<String> {
        let _guard = self.lifecycle.lock().await;
        self.disconnect_all_inner().await;
        self.connect_all_inner(configs).await
    }

    /// Adopt an already-running child process as a managed server. Entry
    /// point for installers that spawn a server themselves.
    ///
    /// The process must still be alive with stdin/stdout pipes attached.
    /// On failure the child is killed and every trace of it removed.
    #[allow(dead_code)]
    pub async fn adopt(
        &self,
        name: &str,
        mut process: tokio::process::Child,
        config: ResolvedServerConfig,
    ) -> Result<usize, GatewayError> {
        let _guard = self.lifecycle.lock().await;

        if let Ok(Some(status)) = process.try_wait() {
            return Err(GatewayError::Connect {
                server: name.to_string(),
                message: format!("process has already exited ({status})"),
            });
        }

        info!(server = %name, "adopting externally spawned server");

        let shared = Arc::new(ServerShared::new(name, ServerState::Connecting));
        self.statuses.insert(name.to_string(), Arc::clone(&shared));

        let spawned = match child::from_child(name, process) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.statuses.remove(name);
                return Err(e);
            }
        };

        let server = self.attach(config, spawned, Arc::clone(&shared));
        self.servers.insert(name.to_string(), Arc::clone(&server));

        match self.handshake_and_index(&server).await {
            Ok(indexed) => {
                shared.mark_online(indexed);
                self.catalog.bump_revision();
                info!(server = %name, tools = indexed, "adopted");
                Ok(indexed)
            }
            Err(e) => {
                shared.mark_error(e.to_string());
                server.cancel.cancel();
                server.child.kill_now().await;
                self.servers.remove(name);
                self.statuses.remove(name);
                self.catalog.remove_server_tools(name);
                Err(e)
            }
        }
    }

    pub fn server_status(&self, name: &str) -> Option<ServerStatus> {
        self.statuses.get(name).map(|r| r.value().snapshot())
    }

    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> =
            self.statuses.iter().map(|r| r.value().snapshot()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn is_server_online(&self, name: &str) -> bool {
        self.statuses
            .get(name)
            .is_some_and(|r| r.value().state() == ServerState::Online)
    }

    pub(crate) fn managed_servers(&self) -> Vec<Arc<ManagedServer>> {
        self.servers.iter().map(|r| Arc::clone(r.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSource, ServerConfig};
    use std::time::Instant;

    /// Minimal fake MCP server: answers initialize (id 1) and tools/list
    /// (id 2), then keeps reading. Request ids are deterministic because the
    /// gateway numbers per-child requests from 1 and the notification
    /// carries no id.
    const HANDSHAKE_ONLY: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n';;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo_upper","description":"Read input and echo it back uppercased","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n';;
  esac
done
"#;

    /// Fake server that also answers the first tools/call (id 3).
    const FULL_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n';;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo_upper","description":"Read input and echo it back uppercased","inputSchema":{"type":"object"}}]}}\n';;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":3,"result":{"content":"HI"}}\n';;
  esac
done
"#;

    /// Fake server advertising three tools.
    const MANY_TOOLS: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":1,"result":{}}\n';;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"t_one","description":"first"},{"name":"t_two","description":"second"},{"name":"t_three","description":"third"}]}}\n';;
  esac
done
"#;

    fn mock_config(name: &str, script: &str) -> ResolvedServerConfig {
        ResolvedServerConfig {
            name: name.to_string(),
            source: ConfigSource::Project,
            config: ServerConfig {
                command: Some("sh".to_string()),
                args: vec!["-c".to_string(), script.to_string()],
                env: Default::default(),
                cwd: None,
            },
        }
    }

    fn new_manager(max_tools: usize) -> (Arc<ToolCatalog>, Arc<DownstreamManager>) {
        let catalog = Arc::new(ToolCatalog::new());
        let manager = DownstreamManager::new(Arc::clone(&catalog), max_tools);
        (catalog, manager)
    }

    #[tokio::test]
    async fn test_connect_call_and_disconnect() {
        let (catalog, manager) = new_manager(100);

        let errors = manager.connect_all(&[mock_config("mock", FULL_SERVER)]).await;
        assert!(errors.is_empty(), "{errors:?}");
        assert!(manager.is_server_online("mock"));

        let info = catalog.get("mock::echo_upper").unwrap();
        assert_eq!(info.server_name, "mock");
        assert_eq!(info.tool_name, "echo_upper");

        let result = manager
            .call_tool("mock::echo_upper", serde_json::json!({"text": "hi"}), 5_000)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"content": "HI"}));

        let status = manager.server_status("mock").unwrap();
        assert_eq!(status.status, ServerState::Online);
        assert_eq!(status.tool_count, 1);
        assert_eq!(status.pending_request_count, 0);
        assert!(status.last_connected_at.is_some());
        assert!(status.avg_response_time_ms > 0.0);

        manager.disconnect_all().await;
        assert_eq!(catalog.tool_count(), 0);
        assert!(!manager.is_server_online("mock"));
        assert!(manager.server_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_collected_not_fatal() {
        let (catalog, manager) = new_manager(100);

        let configs = vec![
            mock_config("good", HANDSHAKE_ONLY),
            ResolvedServerConfig {
                name: "bad".to_string(),
                source: ConfigSource::User,
                config: ServerConfig::default(), // missing command
            },
        ];
        let errors = manager.connect_all(&configs).await;

        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("bad"));
        assert!(manager.is_server_online("good"));
        assert_eq!(catalog.tool_count(), 1);

        let bad_status = manager.server_status("bad").unwrap();
        assert_eq!(bad_status.status, ServerState::Error);
        assert!(bad_status.last_error.is_some());

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_catalog_prefix_invariant() {
        let (catalog, manager) = new_manager(100);
        manager.connect_all(&[mock_config("alpha", HANDSHAKE_ONLY)]).await;

        for tool in catalog.all_tools() {
            assert!(manager.server_status(&tool.server_name).is_some());
            assert!(tool.tool_id.starts_with(&format!("{}::", tool.server_name)));
        }
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_max_tools_per_server_cap() {
        let (catalog, manager) = new_manager(2);
        let errors = manager.connect_all(&[mock_config("many", MANY_TOOLS)]).await;
        assert!(errors.is_empty(), "{errors:?}");

        assert_eq!(catalog.tool_count(), 2);
        assert_eq!(manager.server_status("many").unwrap().tool_count, 2);
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_exactly_at_cap_indexes_all() {
        let (catalog, manager) = new_manager(3);
        manager.connect_all(&[mock_config("many", MANY_TOOLS)]).await;
        assert_eq!(catalog.tool_count(), 3);
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let (_catalog, manager) = new_manager(100);
        let err = manager
            .call_tool("ghost::tool", serde_json::json!({}), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_call_times_out_and_clears_entry() {
        let (_catalog, manager) = new_manager(100);
        manager.connect_all(&[mock_config("quiet", HANDSHAKE_ONLY)]).await;

        let err = manager
            .call_tool("quiet::echo_upper", serde_json::json!({}), 1_100)
            .await
            .unwrap_err();
        match &err {
            GatewayError::Timeout { method, .. } => assert_eq!(method, "tools/call"),
            other => panic!("expected timeout, got {other:?}"),
        }
        // Entry removed on timeout; the table stays consistent
        assert_eq!(
            manager.server_status("quiet").unwrap().pending_request_count,
            0
        );
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_refresh_regenerates_revision() {
        let (catalog, manager) = new_manager(100);
        manager.connect_all(&[]).await;
        let (rev1, ts1) = catalog.meta();

        let errors = manager.refresh(&[]).await;
        assert!(errors.is_empty());
        let (rev2, ts2) = catalog.meta();
        assert_ne!(rev1, rev2);
        assert!(ts2 >= ts1);
    }

    #[tokio::test]
    async fn test_refresh_replaces_catalog() {
        let (catalog, manager) = new_manager(100);
        manager.connect_all(&[mock_config("one", HANDSHAKE_ONLY)]).await;
        assert_eq!(catalog.tool_count(), 1);

        // Refresh onto a different server set: old state cleared first
        let errors = manager.refresh(&[mock_config("two", HANDSHAKE_ONLY)]).await;
        assert!(errors.is_empty());
        assert!(catalog.get("one::echo_upper").is_none());
        assert!(catalog.get("two::echo_upper").is_some());
        assert!(manager.server_status("one").is_none());

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_refresh_idempotent_on_unchanged_environment() {
        let (catalog, manager) = new_manager(100);
        let configs = vec![mock_config("mock", HANDSHAKE_ONLY)];

        manager.connect_all(&configs).await;
        let first: Vec<String> = {
            let mut ids: Vec<String> =
                catalog.all_tools().into_iter().map(|t| t.tool_id).collect();
            ids.sort();
            ids
        };
        let (rev1, _) = catalog.meta();

        let errors = manager.refresh(&configs).await;
        assert!(errors.is_empty(), "{errors:?}");
        let second: Vec<String> = {
            let mut ids: Vec<String> =
                catalog.all_tools().into_iter().map(|t| t.tool_id).collect();
            ids.sort();
            ids
        };
        let (rev2, _) = catalog.meta();

        // Same contents and counts; only the revision moves
        assert_eq!(first, second);
        assert_ne!(rev1, rev2);

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_cancel_in_flight_request() {
        let (_catalog, manager) = new_manager(100);
        manager.connect_all(&[mock_config("quiet", HANDSHAKE_ONLY)]).await;

        // The fake server never answers tools/call; request id 3 stays pending
        let mgr = Arc::clone(&manager);
        let call = tokio::spawn(async move {
            mgr.call_tool("quiet::echo_upper", serde_json::json!({}), 60_000)
                .await
        });

        // Wait for the request to land in the pending table
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if manager.server_status("quiet").unwrap().pending_request_count == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "request never became pending");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Healthy request: refused without force
        assert_eq!(manager.cancel("quiet::3", false), CancelOutcome::Refused);
        // Forced: cancelled
        assert_eq!(manager.cancel("quiet::3", true), CancelOutcome::Cancelled);
        assert_eq!(manager.cancel("quiet::3", true), CancelOutcome::NotFound);
        assert_eq!(manager.cancel("nosuch::1", true), CancelOutcome::NotFound);
        assert_eq!(manager.cancel("garbage", true), CancelOutcome::NotFound);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled { .. }));

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_adopt_running_process() {
        let (catalog, manager) = new_manager(100);
        let (rev_before, _) = catalog.meta();

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(HANDSHAKE_ONLY)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let process = cmd.spawn().unwrap();

        let indexed = manager
            .adopt("adopted", process, mock_config("adopted", HANDSHAKE_ONLY))
            .await
            .unwrap();
        assert_eq!(indexed, 1);
        assert!(manager.is_server_online("adopted"));
        assert!(catalog.get("adopted::echo_upper").is_some());

        let (rev_after, _) = catalog.meta();
        assert_ne!(rev_before, rev_after);

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_adopt_dead_process_rejected() {
        let (_catalog, manager) = new_manager(100);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg("exit 0")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped());
        let mut process = cmd.spawn().unwrap();
        process.wait().await.unwrap();

        let err = manager
            .adopt("dead", process, mock_config("dead", HANDSHAKE_ONLY))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connect { .. }));
        assert!(manager.server_status("dead").is_none());
    }

    #[tokio::test]
    async fn test_call_to_error_server_is_disconnect() {
        let (catalog, manager) = new_manager(100);
        manager.connect_all(&[mock_config("mock", HANDSHAKE_ONLY)]).await;

        // Push the server into error state, keeping its tools in the catalog
        manager
            .statuses
            .get("mock")
            .unwrap()
            .mark_error("Server process exited");
        assert_eq!(catalog.tool_count(), 1);

        let err = manager
            .call_tool("mock::echo_upper", serde_json::json!({}), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Disconnect { .. }));

        manager.disconnect_all().await;
    }
}
