//! A single worker
//!
//! Each worker is a spawned task draining a bounded inbox, so requests to
//! one worker execute strictly in arrival order. The worker refreshes its
//! heartbeat while idle and while awaiting adapter I/O; a wedged handler
//! stops the heartbeat and gets the worker marked crashed by the sweeper.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mahavishnu_core::{Error, PoolId, Result, WorkerId};

use crate::adapter::{RegisteredAdapter, StepRequest};

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawned,
    Idle,
    Busy,
    Crashed,
    Recycled,
    Closed,
}

impl WorkerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Spawned,
            1 => Self::Idle,
            2 => Self::Busy,
            3 => Self::Crashed,
            4 => Self::Recycled,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Spawned => 0,
            Self::Idle => 1,
            Self::Busy => 2,
            Self::Crashed => 3,
            Self::Recycled => 4,
            Self::Closed => 5,
        }
    }

    /// Whether the worker can take more work
    pub fn is_accepting(&self) -> bool {
        matches!(self, Self::Spawned | Self::Idle | Self::Busy)
    }

    /// Whether the worker has left the pool for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Crashed | Self::Recycled | Self::Closed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawned => write!(f, "spawned"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Crashed => write!(f, "crashed"),
            Self::Recycled => write!(f, "recycled"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pool_id: PoolId,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub queued: usize,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

struct WorkItem {
    request: StepRequest,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<serde_json::Value>>,
}

/// Handle to a spawned worker
pub struct WorkerHandle {
    id: WorkerId,
    pool_id: PoolId,
    worker_type: String,
    inbox: mpsc::Sender<WorkItem>,
    status: Arc<AtomicU8>,
    queued: Arc<AtomicUsize>,
    started_at: DateTime<Utc>,
    last_heartbeat: Arc<RwLock<DateTime<Utc>>>,
    drain: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawn a worker bound to the given adapter
    pub fn spawn(
        id: WorkerId,
        pool_id: PoolId,
        worker_type: impl Into<String>,
        adapter: Arc<RegisteredAdapter>,
        inbox_capacity: usize,
        heartbeat_interval: Duration,
        cancel_grace: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(inbox_capacity.max(1));
        let status = Arc::new(AtomicU8::new(WorkerStatus::Spawned.as_u8()));
        let queued = Arc::new(AtomicUsize::new(0));
        let last_heartbeat = Arc::new(RwLock::new(Utc::now()));
        let drain = CancellationToken::new();

        let join = tokio::spawn(worker_loop(
            id,
            adapter,
            rx,
            Arc::clone(&status),
            Arc::clone(&queued),
            Arc::clone(&last_heartbeat),
            drain.clone(),
            heartbeat_interval,
            cancel_grace,
        ));

        Self {
            id,
            pool_id,
            worker_type: worker_type.into(),
            inbox: tx,
            status,
            queued,
            started_at: Utc::now(),
            last_heartbeat,
            drain,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// Current status
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Items waiting in the inbox plus the one executing
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Time of the last heartbeat
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.read()
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            pool_id: self.pool_id,
            worker_type: self.worker_type.clone(),
            status: self.status(),
            queued: self.queue_depth(),
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat(),
        }
    }

    /// Enqueue a request and wait for its result
    ///
    /// Requests to one worker run strictly in arrival order. The per-call
    /// `cancel` token interrupts the request at any suspension point.
    pub async fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        if !self.status().is_accepting() {
            return Err(Error::exhausted("worker is not accepting work")
                .with_context("worker_id", self.id)
                .with_context("status", self.status()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::Relaxed);
        let sent = self
            .inbox
            .send(WorkItem {
                request,
                cancel,
                reply: reply_tx,
            })
            .await;

        if sent.is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::exhausted("worker inbox is closed")
                .with_context("worker_id", self.id));
        }

        reply_rx.await.unwrap_or_else(|_| {
            Err(Error::internal("worker dropped the request")
                .with_context("worker_id", self.id))
        })
    }

    /// Stop accepting new work; the current step completes, then the worker
    /// closes
    pub fn drain(&self) {
        self.drain.cancel();
    }

    /// Force the worker down immediately
    pub fn force_close(&self, final_status: WorkerStatus) {
        if let Some(join) = self.join.lock().take() {
            join.abort();
        }
        self.status
            .store(final_status.as_u8(), Ordering::Relaxed);
    }

    /// Mark the worker crashed (stale heartbeat) and stop its task
    pub fn mark_crashed(&self) {
        warn!(worker_id = %self.id, "worker marked crashed");
        self.force_close(WorkerStatus::Crashed);
    }

    /// Wait for the worker task to finish after a drain
    pub async fn join(&self) {
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    id: WorkerId,
    adapter: Arc<RegisteredAdapter>,
    mut rx: mpsc::Receiver<WorkItem>,
    status: Arc<AtomicU8>,
    queued: Arc<AtomicUsize>,
    last_heartbeat: Arc<RwLock<DateTime<Utc>>>,
    drain: CancellationToken,
    heartbeat_interval: Duration,
    cancel_grace: Duration,
) {
    status.store(WorkerStatus::Idle.as_u8(), Ordering::Relaxed);
    let mut ticker = tokio::time::interval(heartbeat_interval);

    loop {
        // A drained worker finishes its current step but takes nothing new
        if drain.is_cancelled() {
            break;
        }

        tokio::select! {
            item = rx.recv() => {
                let Some(item) = item else { break };
                status.store(WorkerStatus::Busy.as_u8(), Ordering::Relaxed);
                *last_heartbeat.write() = Utc::now();

                let result = run_item(
                    &adapter,
                    item.request,
                    item.cancel,
                    &last_heartbeat,
                    heartbeat_interval,
                    cancel_grace,
                )
                .await;
                queued.fetch_sub(1, Ordering::Relaxed);

                match result {
                    ItemOutcome::Completed(result) => {
                        let _ = item.reply.send(result);
                        status.store(WorkerStatus::Idle.as_u8(), Ordering::Relaxed);
                    }
                    ItemOutcome::Panicked => {
                        // A crash is an infrastructure failure: retryable
                        // while the step has attempts left
                        let _ = item.reply.send(Err(Error::dependency_down(
                            "worker crashed while executing the step",
                        )
                        .with_context("worker_id", id)));
                        status.store(WorkerStatus::Crashed.as_u8(), Ordering::Relaxed);
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                *last_heartbeat.write() = Utc::now();
            }
            _ = drain.cancelled() => {
                debug!(worker_id = %id, "worker draining");
                break;
            }
        }
    }

    status.store(WorkerStatus::Closed.as_u8(), Ordering::Relaxed);
    debug!(worker_id = %id, "worker closed");
}

enum ItemOutcome {
    Completed(Result<serde_json::Value>),
    Panicked,
}

/// Execute one item with timeout enforcement and heartbeats during I/O
async fn run_item(
    adapter: &Arc<RegisteredAdapter>,
    request: StepRequest,
    cancel: CancellationToken,
    last_heartbeat: &Arc<RwLock<DateTime<Utc>>>,
    heartbeat_interval: Duration,
    cancel_grace: Duration,
) -> ItemOutcome {
    let deadline = request.timeout;
    let step = request.step.clone();

    let exec = async {
        adapter
            .execute(request, cancel.clone())
            .await?
            .into_result()
            .await
    };
    let exec = std::panic::AssertUnwindSafe(exec).catch_unwind();
    tokio::pin!(exec);

    let mut ticker = tokio::time::interval(heartbeat_interval);
    let timed_out_at = tokio::time::Instant::now() + deadline;

    loop {
        tokio::select! {
            outcome = &mut exec => {
                return match outcome {
                    Ok(result) => ItemOutcome::Completed(result),
                    Err(_) => ItemOutcome::Panicked,
                };
            }
            _ = ticker.tick() => {
                *last_heartbeat.write() = Utc::now();
            }
            _ = tokio::time::sleep_until(timed_out_at) => {
                // Deadline: cooperative cancel first, then give up after the
                // grace period (dropping the future is the force kill)
                cancel.cancel();
                let _ = tokio::time::timeout(cancel_grace, &mut exec).await;
                return ItemOutcome::Completed(Err(
                    Error::timeout("step exceeded its deadline")
                        .with_context("step", step)
                        .with_context("timeout_ms", deadline.as_millis()),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, LocalAdapter};
    use crate::reliability::{BreakerRegistry, CircuitBreakerConfig};
    use mahavishnu_core::{CorrelationId, ErrorKind, IdGenerator, WorkflowId};
    use serde_json::json;

    fn adapter() -> Arc<RegisteredAdapter> {
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let registry = AdapterRegistry::new(breakers);
        let local = LocalAdapter::new("local");
        local.register_handler("echo", |request| async move { Ok(request.payload) });
        local.register_handler("slow", |_request| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        });
        local.register_handler("order", |request| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(request.payload)
        });
        registry.register(Arc::new(local))
    }

    fn spawn_worker(ids: &IdGenerator) -> WorkerHandle {
        WorkerHandle::spawn(
            WorkerId::generate(ids),
            PoolId::generate(ids),
            "general",
            adapter(),
            8,
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
    }

    fn request(ids: &IdGenerator, operation: &str, payload: serde_json::Value) -> StepRequest {
        StepRequest {
            workflow_id: WorkflowId::generate(ids),
            step: "run".into(),
            operation: operation.into(),
            payload,
            timeout: Duration::from_secs(5),
            correlation_id: CorrelationId::generate(ids),
        }
    }

    #[tokio::test]
    async fn test_executes_and_returns_to_idle() {
        let ids = IdGenerator::new();
        let worker = spawn_worker(&ids);

        let result = worker
            .execute(request(&ids, "echo", json!({"n": 1})), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"n": 1}));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.status(), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_requests_run_in_arrival_order() {
        let ids = IdGenerator::new();
        let worker = Arc::new(spawn_worker(&ids));

        let mut handles = Vec::new();
        for n in 0..5 {
            let worker = Arc::clone(&worker);
            let req = request(&ids, "order", json!({"n": n}));
            handles.push(tokio::spawn(async move {
                worker.execute(req, CancellationToken::new()).await.unwrap()
            }));
            // Give each send time to enter the inbox in order
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        let observed: Vec<i64> = results
            .iter()
            .map(|v| v["n"].as_i64().unwrap())
            .collect();
        assert_eq!(observed, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_deadline_surfaces_timeout() {
        let ids = IdGenerator::new();
        let worker = spawn_worker(&ids);
        let mut req = request(&ids, "slow", json!({}));
        req.timeout = Duration::from_millis(50);

        let err = worker
            .execute(req, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_caller_cancellation_surfaces_cancelled() {
        let ids = IdGenerator::new();
        let worker = Arc::new(spawn_worker(&ids));
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let err = worker
            .execute(request(&ids, "slow", json!({})), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_drain_completes_current_then_closes() {
        let ids = IdGenerator::new();
        let worker = Arc::new(spawn_worker(&ids));

        let in_flight = {
            let worker = Arc::clone(&worker);
            let req = request(&ids, "order", json!({"n": 9}));
            tokio::spawn(async move { worker.execute(req, CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(3)).await;

        worker.drain();
        let result = in_flight.await.unwrap().unwrap();
        assert_eq!(result, json!({"n": 9}));

        worker.join().await;
        assert_eq!(worker.status(), WorkerStatus::Closed);
    }

    #[tokio::test]
    async fn test_heartbeat_advances_while_busy() {
        let ids = IdGenerator::new();
        let worker = Arc::new(spawn_worker(&ids));

        let slow = {
            let worker = Arc::clone(&worker);
            let mut req = request(&ids, "slow", json!({}));
            req.timeout = Duration::from_millis(400);
            tokio::spawn(async move { worker.execute(req, CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        let first = worker.last_heartbeat();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(worker.last_heartbeat() > first);

        let _ = slow.await;
    }
}
