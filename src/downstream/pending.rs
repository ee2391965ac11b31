use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use super::error::GatewayError;

/// A request with no output for longer than this is reported slow.
pub const SLOW_AFTER: Duration = Duration::from_secs(60);

/// A request with no output for longer than this is reported stalled.
pub const STALL_AFTER: Duration = Duration::from_secs(120);

/// Size of the rolling response-time window.
const RESPONSE_WINDOW: usize = 100;

/// Completion slot carried by each pending entry. The reader is the only
/// component that resolves it with a success value.
pub type Waiter = oneshot::Sender<Result<Value, GatewayError>>;

/// One in-flight request to a child.
pub struct PendingEntry {
    /// Empty for `initialize` / `tools/list`.
    pub tool_id: String,
    pub started_at: Instant,
    pub last_heartbeat: Instant,
    pub timeout_ms: u64,
    pub waiter: Waiter,
}

impl PendingEntry {
    pub fn new(tool_id: impl Into<String>, timeout_ms: u64, waiter: Waiter) -> Self {
        let now = Instant::now();
        Self {
            tool_id: tool_id.into(),
            started_at: now,
            last_heartbeat: now,
            timeout_ms,
            waiter,
        }
    }
}

/// Metadata-only view of a pending entry, for the health monitor.
pub struct PendingView {
    pub request_id: i64,
    pub tool_id: String,
    pub started_at: Instant,
    pub last_heartbeat: Instant,
    pub timeout_ms: u64,
}

/// Derived liveness classification of a live pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Active,
    Stalled,
    Timeout,
}

/// Classify an in-flight request by wall-clock age and heartbeat age.
pub fn classify(
    now: Instant,
    started_at: Instant,
    last_heartbeat: Instant,
    timeout_ms: u64,
) -> RequestState {
    if now.duration_since(started_at) > Duration::from_millis(timeout_ms) {
        return RequestState::Timeout;
    }
    let age = now.duration_since(last_heartbeat);
    if age > STALL_AFTER {
        RequestState::Stalled
    } else if age > SLOW_AFTER {
        RequestState::Active
    } else {
        RequestState::Pending
    }
}

/// Outcome of a cancel attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyComplete,
    Refused,
}

/// Per-child table of in-flight request ids. Ids are monotone, start at 1,
/// and are unique for the child's lifetime; the table is cleared on
/// disconnect, so reuse after reconnect is fine.
pub struct PendingTable {
    entries: Mutex<HashMap<i64, PendingEntry>>,
    next_id: AtomicI64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, request_id: i64, entry: PendingEntry) {
        self.lock().insert(request_id, entry);
    }

    pub fn remove(&self, request_id: i64) -> Option<PendingEntry> {
        self.lock().remove(&request_id)
    }

    /// Externally observable pending-request count; always equals the table
    /// cardinality.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Advance every entry's heartbeat. Non-JSON output on the response
    /// channel still proves the child is alive.
    pub fn touch_all(&self, now: Instant) {
        for entry in self.lock().values_mut() {
            entry.last_heartbeat = now;
        }
    }

    /// Fail and drop every entry. Used on stream close and disconnect.
    pub fn fail_all(&self, mut error: impl FnMut() -> GatewayError) {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            let _ = entry.waiter.send(Err(error()));
        }
    }

    pub fn views(&self) -> Vec<PendingView> {
        self.lock()
            .iter()
            .map(|(id, e)| PendingView {
                request_id: *id,
                tool_id: e.tool_id.clone(),
                started_at: e.started_at,
                last_heartbeat: e.last_heartbeat,
                timeout_ms: e.timeout_ms,
            })
            .collect()
    }

    /// Try to cancel one entry.
    ///
    /// Healthy long-running work is only cancelled when forced; a request
    /// that has stalled or already exceeded its own timeout may always be
    /// cancelled. The frame already written to the child is not un-sent —
    /// a late response simply finds no matching id.
    pub fn cancel_entry(&self, request_id: i64, display_id: &str, force: bool) -> CancelOutcome {
        let mut entries = self.lock();
        let Some(entry) = entries.get(&request_id) else {
            return CancelOutcome::NotFound;
        };

        if entry.waiter.is_closed() {
            entries.remove(&request_id);
            return CancelOutcome::AlreadyComplete;
        }

        let state = classify(
            Instant::now(),
            entry.started_at,
            entry.last_heartbeat,
            entry.timeout_ms,
        );
        if !force && !matches!(state, RequestState::Stalled | RequestState::Timeout) {
            return CancelOutcome::Refused;
        }

        let entry = entries.remove(&request_id).expect("entry present under lock");
        let _ = entry.waiter.send(Err(GatewayError::Cancelled {
            request_id: display_id.to_string(),
        }));
        CancelOutcome::Cancelled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling window of the last 100 response times, mean recomputed on every
/// insertion. Mutex held for the push only.
pub struct ResponseWindow {
    inner: Mutex<WindowInner>,
}

struct WindowInner {
    samples: VecDeque<f64>,
    avg: f64,
}

impl ResponseWindow {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WindowInner {
                samples: VecDeque::with_capacity(RESPONSE_WINDOW),
                avg: 0.0,
            }),
        }
    }

    pub fn record(&self, elapsed_ms: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.samples.len() >= RESPONSE_WINDOW {
            inner.samples.pop_front();
        }
        inner.samples.push_back(elapsed_ms);
        inner.avg = inner.samples.iter().sum::<f64>() / inner.samples.len() as f64;
    }

    pub fn avg_ms(&self) -> f64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).avg
    }

    /// (min, max) over the current window, when non-empty.
    #[allow(dead_code)]
    pub fn bounds(&self) -> Option<(f64, f64)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.samples.is_empty() {
            return None;
        }
        let min = inner.samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = inner
            .samples
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        Some((min, max))
    }
}

impl Default for ResponseWindow {
    fn default() -> Self {
        Self::new()
    }
}
