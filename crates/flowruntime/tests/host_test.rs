mod common;

use common::{input, record, registry, sleep, started_host, wait, Log, WAIT};
use flowcore::{
    FlowError, InstanceId, StepOutcome, StepSpec, StoreError, Value, WorkflowBuilder,
    WorkflowError, WorkflowStatus,
};
use flowruntime::{HostConfig, MemoryStateStore, StateStore, WorkflowHost};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn approval_flow() -> flowcore::WorkflowDefinition {
    WorkflowBuilder::new("approval-wait", 1)
        .start_with(record("submitted"))
        .then(wait("approval", "answer"))
        .then(StepSpec::new("record").named("answer").bind("label", "answer"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_start_returns_before_completion() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;
    let definition = WorkflowBuilder::new("slow", 1)
        .start_with(sleep("nap", 100))
        .build()
        .unwrap();
    host.register_workflow(definition).await.unwrap();

    let id = host.start_workflow("slow", Default::default()).await.unwrap();
    assert!(log.entries().is_empty());
    assert_eq!(host.get_instance(id).await.unwrap().status, WorkflowStatus::Running);

    let state = host.wait_for(id, WAIT).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(log.entries(), vec!["nap"]);
}

#[tokio::test]
async fn test_suspended_branch_resumes_with_payload() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;
    host.register_workflow(approval_flow()).await.unwrap();

    let id = host.start_workflow("approval-wait", Default::default()).await.unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Suspended);
    assert_eq!(state.resume_tokens(), vec!["approval".to_string()]);
    assert_eq!(log.entries(), vec!["submitted"]);

    let error = host.resume(id, "nope", None).await.unwrap_err();
    assert!(matches!(
        error,
        FlowError::Workflow(WorkflowError::UnknownResumeToken(_, ref token)) if token == "nope"
    ));

    host.resume(id, "approval", Some(Value::from("granted")))
        .await
        .unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.data().get("answer"), Some(&Value::from("granted")));
    assert_eq!(log.entries(), vec!["submitted", "granted"]);
}

#[tokio::test]
async fn test_join_waits_for_suspended_branch() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;

    let definition = WorkflowBuilder::new("parallel-wait", 1)
        .start_with(record("start"))
        .parallel()
        .branch(|b| b.start_with(wait("signal", "signal")))
        .branch(|b| b.start_with(record("busy")))
        .join()
        .then(StepSpec::new("record").named("after").bind("label", "signal"))
        .build()
        .unwrap();
    host.register_workflow(definition).await.unwrap();

    let id = host.start_workflow("parallel-wait", Default::default()).await.unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Suspended);
    assert_eq!(state.context.joins.len(), 1);
    assert_eq!(log.entries(), vec!["start", "busy"]);

    host.resume(id, "signal", Some(Value::from("go"))).await.unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(log.entries(), vec!["start", "busy", "go"]);
    assert_eq!(state.data().get("signal"), Some(&Value::from("go")));
}

#[tokio::test]
async fn test_cancel_terminates_instance() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;
    host.register_workflow(approval_flow()).await.unwrap();

    let id = host.start_workflow("approval-wait", Default::default()).await.unwrap();
    assert_eq!(host.wait_for(id, WAIT).await.unwrap().status, WorkflowStatus::Suspended);

    host.cancel(id).await.unwrap();
    let state = host.get_instance(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Terminated);
    assert!(state.parked.is_empty());

    let again = host.cancel(id).await.unwrap_err();
    assert!(matches!(again, FlowError::Workflow(WorkflowError::InstanceNotActive(_))));

    let unknown = host.cancel(InstanceId::new_v4()).await.unwrap_err();
    assert!(matches!(unknown, FlowError::Workflow(WorkflowError::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_graceful_stop_lets_running_step_finish() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let config = HostConfig {
        shutdown_timeout_ms: 2_000,
        ..HostConfig::default()
    };
    let host = started_host(registry, config).await;
    let definition = WorkflowBuilder::new("two-naps", 1)
        .start_with(sleep("first", 80))
        .then(record("second"))
        .build()
        .unwrap();
    host.register_workflow(definition).await.unwrap();

    let id = host.start_workflow("two-naps", Default::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    host.stop().await;

    // the in-flight step drained, the next one was never dispatched
    let state = host.get_instance(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Suspended);
    assert_eq!(state.ready.len(), 1);
    assert_eq!(log.entries(), vec!["first"]);

    host.start().await.unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(log.entries(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_forced_stop_requeues_interrupted_step() {
    let log = Log::default();
    let (mut registry, _) = registry(&log);
    let runs = Arc::new(AtomicU32::new(0));
    let r = runs.clone();
    registry.register_fn("count", move |_ctx| {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutcome::Next)
    });
    let config = HostConfig {
        shutdown_timeout_ms: 30,
        ..HostConfig::default()
    };
    let host = started_host(registry, config).await;

    let definition = WorkflowBuilder::new("stuck", 1)
        .start_with(StepSpec::new("count"))
        .then(
            StepSpec::new("sleep")
                .named("stuck")
                .input("label", "stuck")
                .bind("ms", "stuck_ms"),
        )
        .then(record("done"))
        .build()
        .unwrap();
    host.register_workflow(definition).await.unwrap();

    let id = host
        .start_workflow("stuck", input(&[("stuck_ms", Value::from(60_000))]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = tokio::time::Instant::now();
    host.stop().await;
    assert!(stopping.elapsed() < Duration::from_secs(5));

    let mut state = host.get_instance(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Suspended);
    assert_eq!(state.ready.len(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(log.entries().is_empty());

    // shorten the interrupted step before it runs again
    state.context.data.insert("stuck_ms".to_string(), Value::from(1));
    host.store().save(&state).await.unwrap();

    host.start().await.unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(log.entries(), vec!["stuck", "done"]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_parked_instance_survives_restart() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;
    host.register_workflow(approval_flow()).await.unwrap();

    let id = host.start_workflow("approval-wait", Default::default()).await.unwrap();
    assert_eq!(host.wait_for(id, WAIT).await.unwrap().status, WorkflowStatus::Suspended);

    host.stop().await;
    let error = host.resume(id, "approval", Some(Value::from("late"))).await.unwrap_err();
    assert!(matches!(error, FlowError::Workflow(WorkflowError::InstanceNotActive(_))));

    host.start().await.unwrap();
    host.resume(id, "approval", Some(Value::from("yes"))).await.unwrap();
    let state = host.wait_for(id, WAIT).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(log.entries(), vec!["submitted", "yes"]);
}

#[tokio::test]
async fn test_start_requires_running_host() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = WorkflowHost::with_registry(Arc::new(registry), HostConfig::default());
    host.register_workflow(approval_flow()).await.unwrap();
    let mut events = host.subscribe_events();

    let error = host
        .start_workflow("approval-wait", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(error, FlowError::Workflow(WorkflowError::HostNotRunning)));
    assert!(!host.is_running().await);

    // a rejected start leaves nothing behind for a later start() to trip over
    assert!(host.store().list(None).await.unwrap().is_empty());
    assert!(events.try_recv().is_err());

    host.start().await.unwrap();
    assert!(host.store().list(None).await.unwrap().is_empty());
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_unknown_workflow_and_instance() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;

    let error = host.start_workflow("missing", Default::default()).await.unwrap_err();
    assert!(matches!(
        error,
        FlowError::Workflow(WorkflowError::UnknownWorkflow { ref id, version: None }) if id == "missing"
    ));

    let error = host.get_instance(InstanceId::new_v4()).await.unwrap_err();
    assert!(matches!(error, FlowError::Store(StoreError::NotFound(_))));

    let error = host
        .wait_for(InstanceId::new_v4(), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(error, FlowError::Store(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_wait_for_times_out() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;
    let definition = WorkflowBuilder::new("long", 1)
        .start_with(sleep("long", 500))
        .build()
        .unwrap();
    host.register_workflow(definition).await.unwrap();

    let id = host.start_workflow("long", Default::default()).await.unwrap();
    let error = host.wait_for(id, Duration::from_millis(20)).await.unwrap_err();

    assert!(matches!(error, FlowError::Workflow(WorkflowError::WaitTimeout(_))));
}

#[tokio::test]
async fn test_versions_and_duplicate_registration() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let host = started_host(registry, HostConfig::default()).await;

    for version in [1, 2] {
        let definition = WorkflowBuilder::new("versioned", version)
            .start_with(record(&format!("v{}", version)))
            .build()
            .unwrap();
        host.register_workflow(definition).await.unwrap();
    }
    let duplicate = WorkflowBuilder::new("versioned", 2)
        .start_with(record("again"))
        .build()
        .unwrap();
    let error = host.register_workflow(duplicate).await.unwrap_err();
    assert!(matches!(
        error,
        FlowError::Workflow(WorkflowError::AlreadyRegistered { version: 2, .. })
    ));

    assert_eq!(
        host.list_definitions().await,
        vec![("versioned".to_string(), 1), ("versioned".to_string(), 2)]
    );

    let latest = host.start_workflow("versioned", Default::default()).await.unwrap();
    assert_eq!(host.wait_for(latest, WAIT).await.unwrap().version, 2);

    let pinned = host
        .start_workflow_version("versioned", 1, Default::default())
        .await
        .unwrap();
    assert_eq!(host.wait_for(pinned, WAIT).await.unwrap().version, 1);
    assert_eq!(log.entries(), vec!["v2", "v1"]);

    let error = host
        .start_workflow_version("versioned", 9, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        FlowError::Workflow(WorkflowError::UnknownWorkflow { version: Some(9), .. })
    ));
}

#[tokio::test]
async fn test_custom_store_receives_snapshots() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    let store = Arc::new(MemoryStateStore::new());
    let host = WorkflowHost::with_registry(Arc::new(registry), HostConfig::default())
        .with_store(store.clone());
    host.start().await.unwrap();
    host.register_workflow(approval_flow()).await.unwrap();

    let id = host.start_workflow("approval-wait", Default::default()).await.unwrap();
    host.wait_for(id, WAIT).await.unwrap();

    let suspended = store.list(Some(WorkflowStatus::Suspended)).await.unwrap();
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].id, id);
    assert_eq!(suspended[0].workflow_id, "approval-wait");
}

/// Accepts the first `allowed` saves, then reports a backend failure
struct BrokenStore {
    inner: MemoryStateStore,
    allowed: u32,
    saves: AtomicU32,
}

#[async_trait::async_trait]
impl StateStore for BrokenStore {
    async fn save(&self, state: &flowcore::InstanceState) -> Result<(), StoreError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.save(state).await
    }

    async fn load(&self, id: InstanceId) -> Result<flowcore::InstanceState, StoreError> {
        self.inner.load(id).await
    }

    async fn list(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<flowcore::InstanceState>, StoreError> {
        self.inner.list(status).await
    }

    async fn remove(&self, id: InstanceId) -> Result<(), StoreError> {
        self.inner.remove(id).await
    }
}

#[tokio::test]
async fn test_failed_checkpoint_faults_instance() {
    let log = Log::default();
    let (registry, _) = registry(&log);
    // the start snapshot and the first running checkpoint go through
    let store = Arc::new(BrokenStore {
        inner: MemoryStateStore::new(),
        allowed: 2,
        saves: AtomicU32::new(0),
    });
    let host = WorkflowHost::with_registry(Arc::new(registry), HostConfig::default())
        .with_store(store.clone());
    host.start().await.unwrap();
    let definition = WorkflowBuilder::new("unsaved", 1)
        .start_with(record("a"))
        .then(record("b"))
        .build()
        .unwrap();
    host.register_workflow(definition).await.unwrap();

    let mut events = host.subscribe_events();
    let id = host.start_workflow("unsaved", Default::default()).await.unwrap();

    let finished = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(flowcore::ExecutionEvent::WorkflowCompleted { instance_id, status, error, .. })
                    if instance_id == id =>
                {
                    break (status, error);
                }
                Ok(_) => {}
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(finished.0, WorkflowStatus::Faulted);
    let detail = finished.1.unwrap();
    assert!(detail.contains("State store failure"), "{}", detail);
    assert!(detail.contains("disk full"), "{}", detail);
    assert_eq!(log.entries(), vec!["a"]);
}
