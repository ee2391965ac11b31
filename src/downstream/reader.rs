use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ServerShared;
use super::error::GatewayError;
use crate::catalog::ServerState;
use crate::protocol;

/// Reported in `last_error` when a child's response stream closes underneath
/// an online server.
pub const STREAM_CLOSED_ERROR: &str = "Server process exited";

/// Consume a child's response stream until it closes or the token fires.
///
/// One task per child. Every line — parsed or not — counts as activity;
/// matching responses resolve their pending slot; stream close fails every
/// remaining slot with a disconnect error.
pub async fn run_reader<R>(stream: R, server: Arc<ServerShared>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(server = %server.name, "reader cancelled");
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&server, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!(server = %server.name, error = %e, "read error");
                    break;
                }
            }
        }
    }

    // Stream closed underneath us
    if server.state() == ServerState::Online {
        server.mark_error(STREAM_CLOSED_ERROR);
    }
    server
        .pending
        .fail_all(|| GatewayError::disconnected(&server.name));
    debug!(server = %server.name, "response stream closed");
}

fn handle_line(server: &ServerShared, line: &str) {
    server.touch_activity();

    let Some(frame) = protocol::decode_frame(line) else {
        // Diagnostic noise on the response channel still proves the child
        // is alive
        server.pending.touch_all(Instant::now());
        debug!(server = %server.name, "non-JSON output: {}", line.trim_end());
        return;
    };

    let Some(request_id) = protocol::frame_id(&frame) else {
        debug!(server = %server.name, "ignoring message without numeric id");
        return;
    };

    let Some(entry) = server.pending.remove(request_id) else {
        // Unsolicited or already-cancelled id; nobody is waiting
        debug!(server = %server.name, request_id, "no pending request for response");
        return;
    };

    let elapsed_ms = entry.started_at.elapsed().as_secs_f64() * 1000.0;
    server.window.record(elapsed_ms);

    let outcome = match frame.get("error") {
        Some(err) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            Err(GatewayError::Remote(message))
        }
        None => Ok(frame
            .get("result")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))),
    };

    let _ = entry.waiter.send(outcome);
}
