use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// JSON-RPC protocol version on both the host and downstream wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in the initialize handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// An outgoing JSON-RPC request with a numeric id.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outgoing JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// An incoming JSON-RPC request or notification on the host transport.
///
/// The id is kept as a raw `Value` so string ids from hosts are echoed back
/// unchanged; notifications carry no id at all.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Parse one frame. Anything that is not a JSON object is diagnostic noise
/// from the peer and yields `None`.
pub fn decode_frame(line: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(line) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}

/// The numeric correlation id of a message, if it has one.
pub fn frame_id(frame: &Value) -> Option<i64> {
    frame.get("id").and_then(Value::as_i64)
}

/// Write one newline-delimited frame and flush.
///
/// serde_json's compact form never contains a raw newline, so the single
/// trailing `\n` is the whole framing.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    writer.write_all(&body).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
