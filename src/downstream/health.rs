use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{info, warn};

use super::DownstreamManager;
use super::pending::{RequestState, classify};
use crate::catalog::ServerState;

/// Period between health sweeps.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic sweep over every managed server: notice child exits the reader
/// has not seen yet, and log slow/stalled in-flight requests.
///
/// Never cancels anything itself — the caller owns that decision via the
/// cancel operation.
pub async fn run_health_monitor(manager: Arc<DownstreamManager>, shutdown: Arc<Notify>) {
    info!(
        interval_secs = HEALTH_CHECK_INTERVAL.as_secs(),
        "health monitor started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
            _ = shutdown.notified() => {
                info!("health monitor shutting down");
                return;
            }
        }

        sweep(&manager).await;
    }
}

async fn sweep(manager: &DownstreamManager) {
    let now = Instant::now();

    for server in manager.managed_servers() {
        let name = &server.shared.name;

        if let Some(status) = server.child_exit_status().await
            && server.shared.state() == ServerState::Online
        {
            warn!(
                server = %name,
                exit_code = ?status.code(),
                "server process exited unexpectedly"
            );
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            server
                .shared
                .mark_error(format!("Server process exited with code {code}"));
        }

        for view in server.shared.pending.views() {
            let age = now.saturating_duration_since(view.last_heartbeat);
            match classify(now, view.started_at, view.last_heartbeat, view.timeout_ms) {
                RequestState::Stalled => warn!(
                    server = %name,
                    request_id = view.request_id,
                    tool = %view.tool_id,
                    age_secs = age.as_secs(),
                    "request stalled: no output from server"
                ),
                RequestState::Active => info!(
                    server = %name,
                    request_id = view.request_id,
                    tool = %view.tool_id,
                    age_secs = age.as_secs(),
                    "request slow, still waiting"
                ),
                // Pending is healthy; a timed-out waiter is about to fail on
                // its own
                RequestState::Pending | RequestState::Timeout => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolCatalog;
    use crate::config::{ConfigSource, ResolvedServerConfig, ServerConfig};

    fn short_lived_config(name: &str) -> ResolvedServerConfig {
        // Answers the handshake, then exits as soon as stdin is consumed
        let script = r#"
read -r _init
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
read -r _note
read -r _list
printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}\n'
exit 0
"#;
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

    #[tokio::test]
    async fn test_sweep_flags_exited_child() {
        let catalog = Arc::new(ToolCatalog::new());
        let manager = DownstreamManager::new(catalog, 100);

        let errors = manager.connect_all(&[short_lived_config("ephemeral")]).await;
        assert!(errors.is_empty(), "{errors:?}");

        // Wait for the process to exit; the reader will notice EOF, but the
        // sweep must also cope with the exit on its own
        tokio::time::sleep(Duration::from_millis(300)).await;
        sweep(&manager).await;

        let status = manager.server_status("ephemeral").unwrap();
        assert_eq!(status.status, ServerState::Error);
        assert!(status.last_error.is_some());

        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_monitor() {
        let catalog = Arc::new(ToolCatalog::new());
        let manager = DownstreamManager::new(catalog, 100);
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(run_health_monitor(manager, Arc::clone(&shutdown)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_waiters();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor should exit on shutdown")
            .unwrap();
    }
}
