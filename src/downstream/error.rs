use thiserror::Error;

/// Errors crossing the downstream-manager boundary.
///
/// `invoke` flattens every variant into an `ok=false` reply; the other
/// gateway operations surface only `UnknownTool`, `PolicyBlocked` and input
/// validation failures to the host.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad server record (e.g. missing command). Fails that server's connect
    /// only; siblings proceed.
    #[error("{0}")]
    Config(String),

    /// Spawn, handshake or tools/list failed.
    #[error("failed to connect to '{server}': {message}")]
    Connect { server: String, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool is not allowed by policy: {0}")]
    PolicyBlocked(String),

    #[error("request {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The server went away (or was never online) while the request was
    /// pending or being dispatched.
    #[error("server '{server}' {reason}")]
    Disconnect { server: String, reason: String },

    #[error("request {request_id} cancelled")]
    Cancelled { request_id: String },

    /// The child answered with a JSON-RPC error object; `message` verbatim.
    #[error("{0}")]
    Remote(String),
}

impl GatewayError {
    pub fn disconnected(server: impl Into<String>) -> Self {
        GatewayError::Disconnect {
            server: server.into(),
            reason: "disconnected".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_method() {
        let err = GatewayError::Timeout {
            method: "tools/call".to_string(),
            timeout_ms: 30_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("tools/call"));
        assert!(msg.contains("30000"));
    }

    #[test]
    fn test_remote_error_is_message_verbatim() {
        let err = GatewayError::Remote("Invalid params".to_string());
        assert_eq!(err.to_string(), "Invalid params");
    }

    #[test]
    fn test_disconnect_message() {
        let err = GatewayError::disconnected("github");
        assert_eq!(err.to_string(), "server 'github' disconnected");
    }
}
