use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::GatewayError;
use crate::config::ServerConfig;

/// How long a child gets to exit after SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Owned handles for one spawned (or adopted) child process.
///
/// The writer half lives behind an async Mutex so concurrent requests
/// serialize on the pipe; each write is one complete frame plus flush.
#[derive(Debug)]
pub struct ChildHandle {
    pub stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pid: Option<u32>,
}

/// A child split into its handle plus the streams the manager wires into
/// the reader loop and the stderr drain.
#[derive(Debug)]
pub struct SpawnedChild {
    pub handle: ChildHandle,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Spawn the configured command with all three standard streams piped.
///
/// The child inherits the gateway's environment merged with `config.env`
/// (config wins), and runs in its own process group so termination can
/// signal the whole tree.
pub fn spawn(name: &str, config: &ServerConfig) -> Result<SpawnedChild, GatewayError> {
    let command = config
        .command
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            GatewayError::Config(format!(
                "server '{name}' missing command - only stdio transport supported"
            ))
        })?;

    let mut cmd = Command::new(command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| GatewayError::Connect {
        server: name.to_string(),
        message: format!("failed to spawn '{command}': {e}"),
    })?;

    debug!(server = %name, pid = ?child.id(), "spawned child process");
    from_child(name, child)
}

/// Take ownership of an already-running child's pipes. Shared by `spawn`
/// and the adopt path.
pub fn from_child(name: &str, mut child: Child) -> Result<SpawnedChild, GatewayError> {
    let stdin = child.stdin.take().ok_or_else(|| GatewayError::Connect {
        server: name.to_string(),
        message: "process has no stdin pipe".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| GatewayError::Connect {
        server: name.to_string(),
        message: "process has no stdout pipe".to_string(),
    })?;
    let stderr = child.stderr.take();

    let pid = child.id();
    Ok(SpawnedChild {
        handle: ChildHandle {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pid,
        },
        stdout,
        stderr,
    })
}

impl ChildHandle {
    /// Has the process exited? Non-blocking; used by the health monitor.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        self.child.lock().await.try_wait().ok().flatten()
    }

    /// Kill immediately, without the graceful SIGTERM window. Used when a
    /// handshake fails mid-connect.
    pub async fn kill_now(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(error = %e, "kill after failed connect");
        }
    }

    /// Graceful termination: SIGTERM the process group, wait up to 5 s,
    /// SIGKILL if still alive. Errors are logged and swallowed — disconnect
    /// must make progress for every child.
    pub async fn terminate(&self, name: &str) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // process_group(0) at spawn means pid == pgid; negative pid
            // signals the whole group
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret != 0 {
                debug!(server = %name, pid, "failed to signal process group");
            }
        }

        let mut child = self.child.lock().await;

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %name, exit_code = ?status.code(), "child exited");
            }
            Ok(Err(e)) => {
                warn!(server = %name, error = %e, "error waiting for child exit");
            }
            Err(_) => {
                warn!(
                    server = %name,
                    grace_secs = TERM_GRACE.as_secs(),
                    "child ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(server = %name, error = %e, "error killing child");
                }
            }
        }
    }
}

/// Drain a child's stderr in the background so it cannot block on a full
/// pipe. Every line is logged at debug level under the server's name.
pub fn drain_stderr(name: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = %name, "stderr: {line}");
        }
    })
}
