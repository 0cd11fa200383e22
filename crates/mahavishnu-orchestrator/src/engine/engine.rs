//! Workflow engine
//!
//! Drives each workflow through its steps, strictly sequentially: every
//! step runs under its retry policy, the adapter's circuit breaker and a
//! deadline, and commits a checkpoint on success. Terminal failure marks
//! the workflow failed and preserves the last checkpoint; success deletes
//! all checkpoints. Cancellation interrupts at the next step boundary and
//! propagates into the in-flight adapter call.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use mahavishnu_core::{
    CorrelationId, Error, ErrorKind, EventBus, IdGenerator, LifecycleEvent, Result, Task, TaskId,
    WorkflowId,
};

use crate::adapter::{AdapterRegistry, StepRequest};
use crate::persistence::{
    AuditEvent, CheckpointFilter, CheckpointStore, IdempotencyRecord, WorkflowFilter,
    WorkflowRecord, WorkflowStatus, WorkflowStore,
};
use crate::pool::PoolManager;
use crate::reliability::{run_with_retry, BreakerRegistry, RetryPolicy};
use crate::router::{AdmissionController, AdmissionPermit, RouteQuery, Router, RoutingStrategy};

use super::types::{
    CancelReceipt, CheckpointSummary, StepDefinition, StepStatus, SubmitReceipt, SubmitRequest,
    WorkflowStatusReport,
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied when a submission carries no deadline
    pub default_task_timeout: Duration,

    /// Applied to steps without a retry override
    pub default_retry: RetryPolicy,

    /// How long checkpoints of failed/cancelled workflows are retained
    pub checkpoint_retention: Duration,

    /// Idempotency mappings expire after this window
    pub idempotency_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: Duration::from_secs(300),
            default_retry: RetryPolicy::exponential(),
            checkpoint_retention: Duration::from_secs(7 * 24 * 3600),
            idempotency_window: Duration::from_secs(24 * 3600),
        }
    }
}

struct RunningWorkflow {
    cancel: CancellationToken,
}

/// Everything one run task needs
struct RunContext {
    workflow_id: WorkflowId,
    correlation_id: CorrelationId,
    params: serde_json::Value,
    steps: Vec<StepDefinition>,
    adapter_name: String,
    pool_override: Option<mahavishnu_core::PoolId>,
    strategy: Option<RoutingStrategy>,
    deadline: DateTime<Utc>,
    start_index: usize,
    expected_version: u64,
    cancel: CancellationToken,
    _permit: AdmissionPermit,
}

/// Orchestrates checkpointed workflows over the pools
pub struct WorkflowEngine {
    config: EngineConfig,
    ids: Arc<IdGenerator>,
    store: Arc<dyn WorkflowStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    adapters: Arc<AdapterRegistry>,
    pools: Arc<PoolManager>,
    router: Arc<Router>,
    breakers: Arc<BreakerRegistry>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    pulse: Arc<crate::health::SchedulerPulse>,
    degraded: Arc<AtomicBool>,
    specs: RwLock<HashMap<String, Vec<StepDefinition>>>,
    running: Arc<DashMap<WorkflowId, RunningWorkflow>>,
}

impl WorkflowEngine {
    /// Create an engine over the shared components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        ids: Arc<IdGenerator>,
        store: Arc<dyn WorkflowStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        adapters: Arc<AdapterRegistry>,
        pools: Arc<PoolManager>,
        router: Arc<Router>,
        breakers: Arc<BreakerRegistry>,
        admission: Arc<AdmissionController>,
        events: EventBus,
        pulse: Arc<crate::health::SchedulerPulse>,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            ids,
            store,
            checkpoints,
            adapters,
            pools,
            router,
            breakers,
            admission,
            events,
            pulse,
            degraded,
            specs: RwLock::new(HashMap::new()),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Declare the step sequence for a task type
    ///
    /// Unregistered task types run a single step whose operation equals the
    /// task type.
    pub fn register_task_type(&self, task_type: &str, steps: Vec<StepDefinition>) {
        self.specs.write().insert(task_type.to_string(), steps);
    }

    /// Lifecycle event subscription
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<mahavishnu_core::EventEnvelope> {
        self.events.subscribe()
    }

    /// Workflows currently executing in this process
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn steps_for(&self, task_type: &str) -> Vec<StepDefinition> {
        self.specs
            .read()
            .get(task_type)
            .cloned()
            .unwrap_or_else(|| vec![StepDefinition::new("run").with_operation(task_type)])
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Submit a task
    ///
    /// Admission is decided before routing: a rejected submission never
    /// reaches a pool. Re-submitting an idempotency key with identical
    /// params inside the window returns the original workflow.
    #[instrument(skip(self, request), fields(task_type = %request.task_type))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let params_json = serde_json::to_value(&request.params)?;
        let fingerprint = params_json.to_string();

        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.get_idempotency(key).await? {
                if existing.params_fingerprint != fingerprint {
                    return Err(Error::conflict(
                        "idempotency key reused with different params",
                    )
                    .with_context("idempotency_key", key));
                }
                let record = self.store.get(existing.workflow_id).await?;
                debug!(workflow_id = %record.id, "idempotent resubmission");
                return Ok(SubmitReceipt {
                    workflow_id: record.id,
                    accepted_at: record.created_at,
                    degraded: self.is_degraded(),
                });
            }
        }

        // Admission happens before routing
        let permit = self.admission.acquire(request.tenant.as_deref()).await?;

        let adapter = self
            .adapters
            .resolve(&request.task_type, request.adapter.as_deref())
            .await?;
        let adapter_name = adapter.name().to_string();

        let now = Utc::now();
        let deadline = request.deadline.unwrap_or_else(|| {
            now + chrono::Duration::from_std(self.config.default_task_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300))
        });

        let task_id = TaskId::generate(&self.ids);
        let mut task = Task::new(
            task_id,
            request.task_type.clone(),
            request.params.clone(),
            now,
            deadline,
        )?
        .with_priority(request.priority);
        if let Some(key) = &request.idempotency_key {
            task = task.with_idempotency_key(key.clone());
        }

        let workflow_id = WorkflowId::generate(&self.ids);
        let correlation_id = CorrelationId::generate(&self.ids);
        let steps = self.steps_for(&request.task_type);

        self.store
            .create(WorkflowRecord {
                id: workflow_id,
                task_ref: task.id,
                task_type: request.task_type.clone(),
                params: params_json.clone(),
                adapter: Some(adapter_name.clone()),
                status: WorkflowStatus::Created,
                current_step: None,
                steps_total: steps.len() as u32,
                steps_completed: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Some(key) = &request.idempotency_key {
            self.store
                .put_idempotency(IdempotencyRecord {
                    key: key.clone(),
                    params_fingerprint: fingerprint,
                    workflow_id,
                    expires_at: now
                        + chrono::Duration::from_std(self.config.idempotency_window)
                            .unwrap_or_else(|_| chrono::Duration::hours(24)),
                })
                .await?;
        }

        let context = RunContext {
            workflow_id,
            correlation_id,
            params: params_json,
            steps,
            adapter_name,
            pool_override: request.pool_id,
            strategy: request.routing_strategy.clone(),
            deadline,
            start_index: 0,
            expected_version: 0,
            cancel: CancellationToken::new(),
            _permit: permit,
        };

        self.spawn_run(context);
        info!(%workflow_id, "workflow accepted");

        Ok(SubmitReceipt {
            workflow_id,
            accepted_at: now,
            degraded: self.is_degraded(),
        })
    }

    /// Resume a workflow from its latest committed checkpoint
    ///
    /// Execution continues from the step after the one whose checkpoint
    /// committed; the adapter owns idempotency of any step whose checkpoint
    /// did not commit.
    #[instrument(skip(self), fields(%workflow_id))]
    pub async fn resume(&self, workflow_id: WorkflowId) -> Result<SubmitReceipt> {
        if self.running.contains_key(&workflow_id) {
            return Err(Error::conflict("workflow is already executing")
                .with_context("workflow_id", workflow_id));
        }

        let record = self.store.get(workflow_id).await?;
        if record.status.is_terminal() {
            return Err(Error::conflict("workflow already finished")
                .with_context("workflow_id", workflow_id)
                .with_context("status", record.status));
        }

        let steps = self.steps_for(&record.task_type);
        let checkpoint = self.checkpoints.get_latest(workflow_id).await?;
        let (start_index, expected_version) = match &checkpoint {
            Some(cp) => {
                let index = steps.iter().position(|s| s.name == cp.step).ok_or_else(|| {
                    Error::internal("checkpoint step not in workflow definition")
                        .with_context("step", &cp.step)
                })?;
                (index + 1, cp.version)
            }
            None => (0, 0),
        };

        let permit = self.admission.acquire(None).await?;
        let now = Utc::now();
        let adapter_name = record
            .adapter
            .clone()
            .ok_or_else(|| Error::internal("workflow record has no adapter"))?;

        let context = RunContext {
            workflow_id,
            correlation_id: CorrelationId::generate(&self.ids),
            params: record.params.clone(),
            steps,
            adapter_name,
            pool_override: None,
            strategy: None,
            deadline: now
                + chrono::Duration::from_std(self.config.default_task_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            start_index,
            expected_version,
            cancel: CancellationToken::new(),
            _permit: permit,
        };

        info!(%workflow_id, start_index, "resuming workflow");
        self.spawn_run(context);

        Ok(SubmitReceipt {
            workflow_id,
            accepted_at: now,
            degraded: self.is_degraded(),
        })
    }

    /// Cancel a workflow
    ///
    /// An executing workflow is interrupted at its next suspension point; a
    /// workflow known only from the store (e.g. after a restart) is marked
    /// cancelled directly.
    #[instrument(skip(self), fields(%workflow_id))]
    pub async fn cancel(
        &self,
        workflow_id: WorkflowId,
        reason: Option<String>,
    ) -> Result<CancelReceipt> {
        let record = self.store.get(workflow_id).await?;

        if let Some(entry) = self.running.get(&workflow_id) {
            entry.cancel.cancel();
            return Ok(CancelReceipt {
                cancelled_at: Utc::now(),
                current_step: record.current_step,
            });
        }

        if record.status.is_terminal() {
            return Err(Error::conflict("workflow already finished")
                .with_context("workflow_id", workflow_id)
                .with_context("status", record.status));
        }

        self.store
            .update_status(workflow_id, WorkflowStatus::Cancelled, reason)
            .await?;
        self.retain_checkpoints(workflow_id).await;
        self.emit(
            LifecycleEvent::WorkflowCancelled { workflow_id },
            CorrelationId::generate(&self.ids),
        )
        .await;

        Ok(CancelReceipt {
            cancelled_at: Utc::now(),
            current_step: record.current_step,
        })
    }

    /// Status report with checkpoint summaries
    pub async fn status(&self, workflow_id: WorkflowId) -> Result<WorkflowStatusReport> {
        let record = self.store.get(workflow_id).await?;
        let checkpoints = self
            .checkpoints
            .list(CheckpointFilter::for_workflow(workflow_id))
            .await?
            .into_iter()
            .map(|cp| CheckpointSummary {
                step: cp.step,
                version: cp.version,
                created_at: cp.created_at,
            })
            .collect();

        Ok(WorkflowStatusReport {
            workflow_id,
            status: record.status,
            progress: if record.steps_total == 0 {
                0.0
            } else {
                record.steps_completed as f64 / record.steps_total as f64
            },
            last_step: record.current_step,
            checkpoints,
        })
    }

    /// List workflow records
    pub async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowRecord>> {
        self.store.list(filter).await
    }

    /// Audit trail of one workflow
    pub async fn audit(&self, workflow_id: WorkflowId) -> Result<Vec<AuditEvent>> {
        self.store.list_audit(workflow_id).await
    }

    fn spawn_run(&self, context: RunContext) {
        self.running.insert(
            context.workflow_id,
            RunningWorkflow {
                cancel: context.cancel.clone(),
            },
        );

        let engine = self.clone_refs();
        tokio::spawn(async move {
            engine.run_workflow(context).await;
        });
    }

    /// A cheap handle for the spawned run task
    fn clone_refs(&self) -> EngineRefs {
        EngineRefs {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            checkpoints: Arc::clone(&self.checkpoints),
            pools: Arc::clone(&self.pools),
            router: Arc::clone(&self.router),
            breakers: Arc::clone(&self.breakers),
            events: self.events.clone(),
            pulse: Arc::clone(&self.pulse),
            degraded: Arc::clone(&self.degraded),
            running: Arc::clone(&self.running),
        }
    }

    async fn retain_checkpoints(&self, workflow_id: WorkflowId) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.config.checkpoint_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        if let Err(err) = self.checkpoints.retain_until(workflow_id, until).await {
            warn!(%workflow_id, error = %err, "failed to set checkpoint retention");
        }
    }

    async fn emit(&self, event: LifecycleEvent, correlation_id: CorrelationId) {
        let envelope = self.events.emit(event, correlation_id);
        let audit = AuditEvent {
            workflow_id: envelope.event.workflow_id(),
            correlation_id,
            name: envelope.event.name().to_string(),
            detail: serde_json::to_value(&envelope.event).unwrap_or(serde_json::Value::Null),
            recorded_at: envelope.emitted_at,
        };
        if let Err(err) = self.store.append_audit(audit).await {
            warn!(error = %err, "failed to append audit event");
        }
    }
}

/// The subset of engine state a run task owns
struct EngineRefs {
    config: EngineConfig,
    store: Arc<dyn WorkflowStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    pools: Arc<PoolManager>,
    router: Arc<Router>,
    breakers: Arc<BreakerRegistry>,
    events: EventBus,
    pulse: Arc<crate::health::SchedulerPulse>,
    degraded: Arc<AtomicBool>,
    running: Arc<DashMap<WorkflowId, RunningWorkflow>>,
}

impl EngineRefs {
    #[instrument(skip(self, context), fields(workflow_id = %context.workflow_id))]
    async fn run_workflow(&self, context: RunContext) {
        let workflow_id = context.workflow_id;
        let correlation_id = context.correlation_id;

        let fresh_start = match self
            .store
            .update_status(workflow_id, WorkflowStatus::Running, None)
            .await
        {
            Ok(()) => true,
            // A resumed workflow is already Running
            Err(err) if err.kind == ErrorKind::Conflict => false,
            Err(err) => {
                warn!(%workflow_id, error = %err, "failed to start workflow");
                self.running.remove(&workflow_id);
                return;
            }
        };

        if fresh_start && context.start_index == 0 {
            self.emit(LifecycleEvent::WorkflowStarted { workflow_id }, correlation_id)
                .await;
        }

        let remaining = context
            .deadline
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline_instant = tokio::time::Instant::now() + remaining;

        let mut expected_version = context.expected_version;

        for index in context.start_index..context.steps.len() {
            // Step boundary: the cancellation checkpoint
            if context.cancel.is_cancelled() {
                self.finish_cancelled(workflow_id, correlation_id, "cancelled by caller")
                    .await;
                return;
            }

            let step = &context.steps[index];
            self.pulse.beat();
            if let Err(err) = self
                .store
                .update_progress(workflow_id, &step.name, index as u32, None)
                .await
            {
                warn!(%workflow_id, error = %err, "failed to record progress");
            }

            let outcome = self
                .execute_step(&context, step, deadline_instant)
                .await;

            match outcome {
                Ok(output) => {
                    match self
                        .checkpoints
                        .put(workflow_id, &step.name, &output, expected_version)
                        .await
                    {
                        Ok(version) => expected_version = version,
                        Err(err) => {
                            self.finish_failed(workflow_id, correlation_id, err).await;
                            return;
                        }
                    }

                    self.emit(
                        LifecycleEvent::WorkflowStepCompleted {
                            workflow_id,
                            step: step.name.clone(),
                        },
                        correlation_id,
                    )
                    .await;
                    let _ = self
                        .store
                        .update_progress(workflow_id, &step.name, index as u32 + 1, None)
                        .await;
                    self.pulse.beat();
                }
                Err(err) if err.kind == ErrorKind::Cancelled => {
                    self.audit_step(workflow_id, correlation_id, &step.name, StepStatus::Cancelled)
                        .await;
                    self.finish_cancelled(workflow_id, correlation_id, &err.to_string())
                        .await;
                    return;
                }
                Err(err) => {
                    self.audit_step(
                        workflow_id,
                        correlation_id,
                        &step.name,
                        StepStatus::TerminalFail,
                    )
                    .await;
                    self.finish_failed(workflow_id, correlation_id, err).await;
                    return;
                }
            }
        }

        self.finish_succeeded(workflow_id, correlation_id).await;
    }

    /// One step under retry, breaker and deadline
    async fn execute_step(
        &self,
        context: &RunContext,
        step: &StepDefinition,
        deadline: tokio::time::Instant,
    ) -> Result<serde_json::Value> {
        let policy = step
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let breaker = self.breakers.breaker(&context.adapter_name);

        // The workflow token reaches the retry driver so a cancellation
        // arriving mid-backoff interrupts the sleep
        run_with_retry(&policy, deadline, &context.cancel, |attempt| {
            let breaker = Arc::clone(&breaker);
            let step_name = step.name.clone();
            let operation = step.operation.clone();
            let payload = context.params.clone();
            let cancel = context.cancel.child_token();
            let adapter_name = context.adapter_name.clone();
            let pool_override = context.pool_override;
            let strategy = context.strategy.clone();
            let workflow_id = context.workflow_id;
            let correlation_id = context.correlation_id;
            let step_timeout = step.timeout;

            async move {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Err(Error::timeout("task deadline elapsed")
                        .with_context("step", step_name));
                }
                let remaining = deadline - now;
                let timeout = step_timeout.map_or(remaining, |t| t.min(remaining));

                let permit = breaker.try_acquire()?;

                let pool_id = match pool_override {
                    Some(pool_id) => pool_id,
                    None => {
                        let query = RouteQuery {
                            adapter: Some(adapter_name.clone()),
                            worker_type: None,
                            strategy: strategy.clone(),
                        };
                        let degraded =
                            self.degraded.load(std::sync::atomic::Ordering::Relaxed);
                        match self.router.route(&query, degraded).await {
                            Ok(pool_id) => pool_id,
                            Err(err) => {
                                // No pool reached the dependency; the permit
                                // is dropped without an outcome
                                return Err(err);
                            }
                        }
                    }
                };

                debug!(%workflow_id, step = %step_name, attempt, %pool_id, "executing step");
                let request = StepRequest {
                    workflow_id,
                    step: step_name,
                    operation,
                    payload,
                    timeout,
                    correlation_id,
                };

                match self.pools.execute(pool_id, request, cancel).await {
                    Ok(value) => {
                        permit.success();
                        Ok(value)
                    }
                    Err(err) => {
                        // Cancellation is not a dependency outcome
                        if err.kind == ErrorKind::Cancelled {
                            drop(permit);
                        } else {
                            permit.failure();
                        }
                        Err(err)
                    }
                }
            }
        })
        .await
    }

    async fn finish_succeeded(&self, workflow_id: WorkflowId, correlation_id: CorrelationId) {
        match self
            .store
            .update_status(workflow_id, WorkflowStatus::Succeeded, None)
            .await
        {
            Ok(()) => {
                if let Err(err) = self.checkpoints.delete(workflow_id).await {
                    warn!(%workflow_id, error = %err, "failed to delete checkpoints");
                }
                self.emit(LifecycleEvent::WorkflowCompleted { workflow_id }, correlation_id)
                    .await;
                info!(%workflow_id, "workflow succeeded");
            }
            Err(err) => warn!(%workflow_id, error = %err, "succeeded transition rejected"),
        }
        self.running.remove(&workflow_id);
    }

    async fn finish_failed(
        &self,
        workflow_id: WorkflowId,
        correlation_id: CorrelationId,
        error: Error,
    ) {
        match self
            .store
            .update_status(
                workflow_id,
                WorkflowStatus::Failed,
                Some(error.to_string()),
            )
            .await
        {
            Ok(()) => {
                self.retain_checkpoints(workflow_id).await;
                self.emit(
                    LifecycleEvent::WorkflowFailed {
                        workflow_id,
                        error: error.to_string(),
                    },
                    correlation_id,
                )
                .await;
                warn!(%workflow_id, error = %error, "workflow failed");
            }
            Err(err) => warn!(%workflow_id, error = %err, "failed transition rejected"),
        }
        self.running.remove(&workflow_id);
    }

    async fn finish_cancelled(
        &self,
        workflow_id: WorkflowId,
        correlation_id: CorrelationId,
        reason: &str,
    ) {
        match self
            .store
            .update_status(
                workflow_id,
                WorkflowStatus::Cancelled,
                Some(reason.to_string()),
            )
            .await
        {
            Ok(()) => {
                self.retain_checkpoints(workflow_id).await;
                self.emit(LifecycleEvent::WorkflowCancelled { workflow_id }, correlation_id)
                    .await;
                info!(%workflow_id, "workflow cancelled");
            }
            Err(err) => warn!(%workflow_id, error = %err, "cancelled transition rejected"),
        }
        self.running.remove(&workflow_id);
    }

    /// Record a step's final state in the audit stream
    async fn audit_step(
        &self,
        workflow_id: WorkflowId,
        correlation_id: CorrelationId,
        step: &str,
        status: StepStatus,
    ) {
        let audit = AuditEvent {
            workflow_id,
            correlation_id,
            name: "workflow.step_resolved".to_string(),
            detail: serde_json::json!({"step": step, "status": status}),
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.store.append_audit(audit).await {
            warn!(error = %err, "failed to append audit event");
        }
    }

    async fn retain_checkpoints(&self, workflow_id: WorkflowId) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.config.checkpoint_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        if let Err(err) = self.checkpoints.retain_until(workflow_id, until).await {
            warn!(%workflow_id, error = %err, "failed to set checkpoint retention");
        }
    }

    async fn emit(&self, event: LifecycleEvent, correlation_id: CorrelationId) {
        let envelope = self.events.emit(event, correlation_id);
        let audit = AuditEvent {
            workflow_id: envelope.event.workflow_id(),
            correlation_id,
            name: envelope.event.name().to_string(),
            detail: serde_json::to_value(&envelope.event).unwrap_or(serde_json::Value::Null),
            recorded_at: envelope.emitted_at,
        };
        if let Err(err) = self.store.append_audit(audit).await {
            warn!(error = %err, "failed to append audit event");
        }
    }
}
