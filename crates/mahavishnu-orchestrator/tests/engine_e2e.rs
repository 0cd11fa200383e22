//! End-to-end scenarios against in-memory and filesystem stores

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use mahavishnu_core::{Config, ErrorKind, LifecycleEvent, WorkflowId};
use mahavishnu_orchestrator::adapter::{Adapter, LocalAdapter};
use mahavishnu_orchestrator::engine::{StepDefinition, SubmitRequest};
use mahavishnu_orchestrator::persistence::{
    CheckpointFilter, FsCheckpointStore, InMemoryWorkflowStore, WorkflowStatus,
};
use mahavishnu_orchestrator::pool::PoolSpec;
use mahavishnu_orchestrator::reliability::{CircuitState, RetryPolicy};
use mahavishnu_orchestrator::Orchestrator;

struct Fixture {
    orchestrator: Orchestrator,
    echo_calls: Arc<AtomicU32>,
    flaky_calls: Arc<AtomicU32>,
    flaky_failures: Arc<AtomicU32>,
    sleepy_calls: Arc<AtomicU32>,
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.concurrency.admission_wait = Duration::from_millis(100);
    config.deadlines.cancel_grace_period = Duration::from_secs(1);
    config.breaker.consecutive_threshold = 5;
    config.breaker.cooldown = Duration::from_millis(500);
    config.breaker.max_cooldown = Duration::from_millis(2000);
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(100);
    config
}

async fn fixture_with_config(config: Config) -> Fixture {
    let orchestrator = Orchestrator::in_memory(config);

    let echo_calls = Arc::new(AtomicU32::new(0));
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let flaky_failures = Arc::new(AtomicU32::new(0));
    let sleepy_calls = Arc::new(AtomicU32::new(0));

    let local = LocalAdapter::new("local");
    {
        let calls = Arc::clone(&echo_calls);
        local.register_handler("echo", move |request| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(request.payload)
            }
        });
    }
    {
        let calls = Arc::clone(&flaky_calls);
        let failures = Arc::clone(&flaky_failures);
        local.register_handler("flaky", move |_request| {
            let calls = Arc::clone(&calls);
            let failures = Arc::clone(&failures);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    Err(mahavishnu_core::Error::dependency_down("upstream down"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        });
    }
    {
        let calls = Arc::clone(&sleepy_calls);
        local.register_handler("sleepy", move |_request| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }
        });
    }
    local.register_handler("fail_terminal", |_request| async move {
        Err(mahavishnu_core::Error::invalid("bad step input"))
    });

    let adapter: Arc<dyn Adapter> = Arc::new(local);
    orchestrator.adapters.register(adapter);
    orchestrator.adapters.initialize_all().await;

    orchestrator
        .pools
        .spawn_pool(PoolSpec {
            worker_type: "general".into(),
            adapter: "local".into(),
            min_workers: 2,
            max_workers: 4,
            backpressure: None,
        })
        .await
        .unwrap();

    // Collect every emitted lifecycle event
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rx = orchestrator.engine.subscribe();
    let sink = Arc::clone(&events);
    tokio::spawn(async move {
        while let Ok(envelope) = rx.recv().await {
            sink.lock().push(envelope.event);
        }
    });

    Fixture {
        orchestrator,
        echo_calls,
        flaky_calls,
        flaky_failures,
        sleepy_calls,
        events,
    }
}

async fn fixture() -> Fixture {
    fixture_with_config(test_config()).await
}

async fn wait_for_status(
    fixture: &Fixture,
    workflow_id: WorkflowId,
    expected: WorkflowStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let report = fixture
            .orchestrator
            .engine
            .status(workflow_id)
            .await
            .unwrap();
        if report.status == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {workflow_id} stuck in {:?}, expected {expected:?}",
            report.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn events_for(fixture: &Fixture, workflow_id: WorkflowId) -> Vec<LifecycleEvent> {
    fixture
        .events
        .lock()
        .iter()
        .filter(|event| event.workflow_id() == workflow_id)
        .cloned()
        .collect()
}

#[tokio::test]
async fn e2e_happy_path_single_step() {
    let f = fixture().await;

    let receipt = f
        .orchestrator
        .engine
        .submit(
            SubmitRequest::new("echo")
                .with_param("x", json!(1))
                .with_adapter("local"),
        )
        .await
        .unwrap();

    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Succeeded, Duration::from_secs(5))
        .await;

    // Exactly one checkpoint was written during the run, zero remain
    let audit = f
        .orchestrator
        .engine
        .audit(receipt.workflow_id)
        .await
        .unwrap();
    let step_commits = audit
        .iter()
        .filter(|e| e.name == "workflow.step_completed")
        .count();
    assert_eq!(step_commits, 1);
    let remaining = f
        .orchestrator
        .checkpoints
        .list(CheckpointFilter::for_workflow(receipt.workflow_id))
        .await
        .unwrap();
    assert!(remaining.is_empty());

    // started then completed, once each
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = events_for(&f, receipt.workflow_id);
    let starts = events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::WorkflowStarted { .. }))
        .count();
    let completions = events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::WorkflowCompleted { .. }))
        .count();
    assert_eq!((starts, completions), (1, 1));

    assert_eq!(f.echo_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn e2e_retry_then_success() {
    let f = fixture().await;
    f.flaky_failures.store(2, Ordering::SeqCst);

    f.orchestrator.engine.register_task_type(
        "flaky",
        vec![StepDefinition::new("run").with_operation("flaky").with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_millis(10))
                .with_multiplier(2.0)
                .with_max_delay(Duration::from_millis(100)),
        )],
    );

    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("flaky").with_adapter("local"))
        .await
        .unwrap();

    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Succeeded, Duration::from_secs(5))
        .await;

    // Two failures, then the third attempt succeeded
    assert_eq!(f.flaky_calls.load(Ordering::SeqCst), 3);
    // Below both thresholds: the breaker never opened
    assert_eq!(
        f.orchestrator.breakers.breaker("local").state(),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn e2e_breaker_opens_and_recovers() {
    let f = fixture().await;
    f.flaky_failures.store(1000, Ordering::SeqCst);

    f.orchestrator.engine.register_task_type(
        "flaky",
        vec![StepDefinition::new("run").with_operation("flaky").with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_millis(1)),
        )],
    );

    // Five DependencyDown failures in a row: the breaker opens
    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("flaky").with_adapter("local"))
        .await
        .unwrap();
    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Failed, Duration::from_secs(5)).await;

    assert_eq!(f.flaky_calls.load(Ordering::SeqCst), 5);
    let breaker = f.orchestrator.breakers.breaker("local");
    assert_eq!(breaker.state(), CircuitState::Open);

    // The next call fails fast without reaching the adapter
    f.orchestrator.engine.register_task_type(
        "flaky_once",
        vec![StepDefinition::new("run")
            .with_operation("flaky")
            .with_retry(RetryPolicy::no_retry())],
    );
    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("flaky_once").with_adapter("local"))
        .await
        .unwrap();
    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Failed, Duration::from_secs(5)).await;
    assert_eq!(f.flaky_calls.load(Ordering::SeqCst), 5, "adapter was contacted while open");

    // After the cooldown one successful probe closes the breaker
    f.flaky_failures.store(0, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("flaky_once").with_adapter("local"))
        .await
        .unwrap();
    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Succeeded, Duration::from_secs(5))
        .await;
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn e2e_cancellation_preserves_checkpoints() {
    let f = fixture().await;

    f.orchestrator.engine.register_task_type(
        "long",
        vec![
            StepDefinition::new("prepare").with_operation("echo"),
            StepDefinition::new("crunch").with_operation("sleepy"),
        ],
    );

    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("long").with_adapter("local"))
        .await
        .unwrap();

    // Let the first step commit and the long step start
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while f.sleepy_calls.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = tokio::time::Instant::now();
    f.orchestrator
        .engine
        .cancel(receipt.workflow_id, Some("operator request".into()))
        .await
        .unwrap();

    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Cancelled, Duration::from_millis(1500))
        .await;
    assert!(started.elapsed() <= Duration::from_millis(1500));

    // The committed checkpoint is preserved
    let checkpoints = f
        .orchestrator
        .checkpoints
        .list(CheckpointFilter::for_workflow(receipt.workflow_id))
        .await
        .unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].step, "prepare");

    // No further events for this workflow after cancellation
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = events_for(&f, receipt.workflow_id);
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::WorkflowCancelled { .. })
    ));
    let count_at_cancel = events.len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(events_for(&f, receipt.workflow_id).len(), count_at_cancel);
}

#[tokio::test]
async fn cancellation_during_retry_backoff_is_prompt() {
    let f = fixture().await;
    f.flaky_failures.store(1000, Ordering::SeqCst);

    // Long backoff between failing attempts: the cancel lands mid-sleep
    f.orchestrator.engine.register_task_type(
        "stubborn",
        vec![StepDefinition::new("run").with_operation("flaky").with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_secs(10))
                .with_multiplier(1.0),
        )],
    );

    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("stubborn").with_adapter("local"))
        .await
        .unwrap();

    // Wait for the first attempt to fail, putting the workflow into backoff
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while f.flaky_calls.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = tokio::time::Instant::now();
    f.orchestrator
        .engine
        .cancel(receipt.workflow_id, None)
        .await
        .unwrap();

    // The backoff sleep is interrupted, not waited out
    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Cancelled, Duration::from_millis(1500))
        .await;
    assert!(started.elapsed() <= Duration::from_millis(1500));
}

#[tokio::test]
async fn e2e_resume_continues_after_restart() {
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let shared_workflows = Arc::new(InMemoryWorkflowStore::new());

    let steps = || {
        vec![
            StepDefinition::new("one").with_operation("step"),
            StepDefinition::new("two").with_operation("step"),
            StepDefinition::new("three").with_operation("step"),
        ]
    };

    let step3_runs = Arc::new(AtomicU32::new(0));
    let first_id;

    // First process: step three wedges after one and two commit
    {
        let checkpoints = Arc::new(
            FsCheckpointStore::new(checkpoint_dir.path(), 4 * 1024 * 1024)
                .await
                .unwrap(),
        );
        let orchestrator = Orchestrator::new(
            test_config(),
            shared_workflows.clone(),
            checkpoints.clone(),
        );

        let steps_done = Arc::new(AtomicU32::new(0));
        let local = LocalAdapter::new("local");
        {
            let steps_done = Arc::clone(&steps_done);
            local.register_handler("step", move |request| {
                let steps_done = Arc::clone(&steps_done);
                async move {
                    if request.step == "three" {
                        // Simulated crash point: this process never finishes
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    steps_done.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"step": request.step}))
                }
            });
        }
        let adapter: Arc<dyn Adapter> = Arc::new(local);
        orchestrator.adapters.register(adapter);
        orchestrator.adapters.initialize_all().await;
        orchestrator
            .pools
            .spawn_pool(PoolSpec {
                worker_type: "general".into(),
                adapter: "local".into(),
                min_workers: 1,
                max_workers: 2,
                backpressure: None,
            })
            .await
            .unwrap();
        orchestrator.engine.register_task_type("pipeline", steps());

        let receipt = orchestrator
            .engine
            .submit(SubmitRequest::new("pipeline").with_adapter("local"))
            .await
            .unwrap();
        first_id = receipt.workflow_id;

        // Wait until the second checkpoint committed
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let latest = checkpoints.get_latest(first_id).await.unwrap();
            if latest.as_ref().map(|c| c.version) == Some(2) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The "process" dies here; the wedged run task is abandoned
    }

    // Second process over the same durable state
    let checkpoints = Arc::new(
        FsCheckpointStore::new(checkpoint_dir.path(), 4 * 1024 * 1024)
            .await
            .unwrap(),
    );
    let orchestrator = Orchestrator::new(test_config(), shared_workflows, checkpoints.clone());

    let local = LocalAdapter::new("local");
    {
        let step3_runs = Arc::clone(&step3_runs);
        local.register_handler("step", move |request| {
            let step3_runs = Arc::clone(&step3_runs);
            async move {
                if request.step == "three" {
                    step3_runs.fetch_add(1, Ordering::SeqCst);
                }
                Ok(json!({"step": request.step}))
            }
        });
    }
    let adapter: Arc<dyn Adapter> = Arc::new(local);
    orchestrator.adapters.register(adapter);
    orchestrator.adapters.initialize_all().await;
    orchestrator
        .pools
        .spawn_pool(PoolSpec {
            worker_type: "general".into(),
            adapter: "local".into(),
            min_workers: 1,
            max_workers: 2,
            backpressure: None,
        })
        .await
        .unwrap();
    orchestrator.engine.register_task_type("pipeline", steps());

    orchestrator.engine.resume(first_id).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = orchestrator.engine.status(first_id).await.unwrap();
        if report.status == WorkflowStatus::Succeeded {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Step three ran exactly once, and success deleted the checkpoints
    assert_eq!(step3_runs.load(Ordering::SeqCst), 1);
    assert!(checkpoints.get_latest(first_id).await.unwrap().is_none());
}

#[tokio::test]
async fn e2e_admission_rejects_at_capacity() {
    let mut config = test_config();
    config.concurrency.max_concurrent_workflows = 2;
    let f = fixture_with_config(config).await;

    f.orchestrator
        .engine
        .register_task_type("nap", vec![StepDefinition::new("run").with_operation("sleepy")]);

    f.orchestrator
        .engine
        .submit(SubmitRequest::new("nap").with_adapter("local"))
        .await
        .unwrap();
    f.orchestrator
        .engine
        .submit(SubmitRequest::new("nap").with_adapter("local"))
        .await
        .unwrap();

    // Saturated: one more submission fails after admission_wait
    let started = tokio::time::Instant::now();
    let err = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("nap").with_adapter("local"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Exhausted);
    assert!(started.elapsed() >= Duration::from_millis(100));

    // The rejected task never reached a pool
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.sleepy_calls.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn idempotent_resubmission_returns_same_workflow() {
    let f = fixture().await;

    let submit = || {
        SubmitRequest::new("echo")
            .with_param("x", json!(1))
            .with_adapter("local")
            .with_idempotency_key("job-1")
    };

    let first = f.orchestrator.engine.submit(submit()).await.unwrap();
    wait_for_status(&f, first.workflow_id, WorkflowStatus::Succeeded, Duration::from_secs(5)).await;

    let second = f.orchestrator.engine.submit(submit()).await.unwrap();
    assert_eq!(first.workflow_id, second.workflow_id);
    assert_eq!(f.echo_calls.load(Ordering::SeqCst), 1, "executed twice");

    // Same key with different params is a conflict
    let err = f
        .orchestrator
        .engine
        .submit(
            SubmitRequest::new("echo")
                .with_param("x", json!(2))
                .with_adapter("local")
                .with_idempotency_key("job-1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[tokio::test]
async fn failure_retains_checkpoints_for_ttl() {
    let f = fixture().await;

    f.orchestrator.engine.register_task_type(
        "doomed",
        vec![
            StepDefinition::new("prepare").with_operation("echo"),
            StepDefinition::new("explode").with_operation("fail_terminal"),
        ],
    );

    let receipt = f
        .orchestrator
        .engine
        .submit(SubmitRequest::new("doomed").with_adapter("local"))
        .await
        .unwrap();
    wait_for_status(&f, receipt.workflow_id, WorkflowStatus::Failed, Duration::from_secs(5)).await;

    // The committed checkpoint survives the failure and immediate GC
    f.orchestrator
        .checkpoints
        .gc_expired(chrono::Utc::now())
        .await
        .unwrap();
    let checkpoints = f
        .orchestrator
        .checkpoints
        .list(CheckpointFilter::for_workflow(receipt.workflow_id))
        .await
        .unwrap();
    assert_eq!(checkpoints.len(), 1);

    let report = f.orchestrator.engine.status(receipt.workflow_id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.last_step.as_deref(), Some("explode"));
}

#[tokio::test]
async fn degraded_flag_rides_on_receipts() {
    let f = fixture().await;

    // Force the degraded flag through the supervisor path
    f.orchestrator.breakers.breaker("local").trip();
    f.orchestrator.health.components().await;
    assert!(f.orchestrator.health.is_degraded());

    // An explicitly-requested adapter is admitted even while its breaker
    // heals, and the receipt carries the advisory flag
    f.orchestrator.breakers.breaker("local").reset();
    let receipt = f
        .orchestrator
        .engine
        .submit(
            SubmitRequest::new("echo")
                .with_param("x", json!(1))
                .with_adapter("local"),
        )
        .await
        .unwrap();
    assert!(receipt.degraded);
}
