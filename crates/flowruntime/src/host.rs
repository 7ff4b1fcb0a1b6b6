use crate::config::HostConfig;
use crate::registry::StepRegistry;
use crate::scheduler::{Command, Control, Scheduler};
use crate::store::{MemoryStateStore, StateStore};
use chrono::Utc;
use flowcore::{
    ContextData, EventBus, ExecutionEvent, FlowError, InstanceId, InstanceState, Value,
    WorkflowDefinition, WorkflowError, WorkflowStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 16;

/// Live instance task
struct InstanceHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<WorkflowStatus>,
    task: JoinHandle<InstanceState>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    shutdown: CancellationToken,
    force: CancellationToken,
}

/// Process-wide entry point: owns the workflow definitions and the running
/// instances
pub struct WorkflowHost {
    config: HostConfig,
    registry: Arc<StepRegistry>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    scheduler: Arc<Scheduler>,
    definitions: RwLock<HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>>,
    instances: Mutex<HashMap<InstanceId, InstanceHandle>>,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkflowHost {
    /// Create a host with an empty step registry
    pub fn new(config: HostConfig) -> Self {
        Self::with_registry(Arc::new(StepRegistry::new()), config)
    }

    /// Create a host with a pre-configured registry and in-memory state
    pub fn with_registry(registry: Arc<StepRegistry>, config: HostConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            event_bus.clone(),
            store.clone(),
            config.max_parallel_steps,
        ));

        Self {
            config,
            registry,
            event_bus,
            store,
            scheduler,
            definitions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Replace the state store
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.scheduler = Arc::new(Scheduler::new(
            self.registry.clone(),
            self.event_bus.clone(),
            store.clone(),
            self.config.max_parallel_steps,
        ));
        self.store = store;
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Register a workflow definition under its `(id, version)`
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), FlowError> {
        for step_type in definition.step_types() {
            if !self.registry.contains(step_type) {
                return Err(WorkflowError::UnknownStepType(step_type.to_string()).into());
            }
        }

        let mut definitions = self.definitions.write().await;
        let versions = definitions.entry(definition.id().to_string()).or_default();
        if versions.contains_key(&definition.version()) {
            return Err(WorkflowError::AlreadyRegistered {
                id: definition.id().to_string(),
                version: definition.version(),
            }
            .into());
        }

        tracing::info!(
            workflow = %definition.id(),
            version = definition.version(),
            steps = definition.step_count(),
            "Registered workflow"
        );
        versions.insert(definition.version(), Arc::new(definition));
        Ok(())
    }

    /// Registered `(id, version)` pairs, sorted
    pub async fn list_definitions(&self) -> Vec<(String, u32)> {
        let definitions = self.definitions.read().await;
        let mut keys: Vec<(String, u32)> = definitions
            .iter()
            .flat_map(|(id, versions)| versions.keys().map(move |v| (id.clone(), *v)))
            .collect();
        keys.sort();
        keys
    }

    /// Look up a definition; `None` as version means the latest one
    pub async fn definition(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        let definitions = self.definitions.read().await;
        let versions = definitions.get(id);
        let found = match version {
            Some(v) => versions.and_then(|vs| vs.get(&v)),
            None => versions.and_then(|vs| vs.values().next_back()),
        };
        found.cloned().ok_or_else(|| WorkflowError::UnknownWorkflow {
            id: id.to_string(),
            version,
        })
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Begin accepting instance starts. Instances left `Suspended` by an
    /// earlier `stop()` are picked up again.
    pub async fn start(&self) -> Result<(), FlowError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.running {
                return Ok(());
            }
            *lifecycle = Lifecycle {
                running: true,
                shutdown: CancellationToken::new(),
                force: CancellationToken::new(),
            };
        }
        tracing::info!("Workflow host started");

        for state in self.store.list(Some(WorkflowStatus::Suspended)).await? {
            let id = state.id;
            if self.instances.lock().await.contains_key(&id) {
                continue;
            }
            if let Err(e) = self.resume_instance(id).await {
                tracing::warn!(instance = %id, error = %e, "Could not revive suspended instance");
            }
        }
        Ok(())
    }

    /// Graceful shutdown: stop dispatching, wait up to the configured timeout
    /// for in-flight steps, then abort the rest. Unfinished instances end up
    /// `Suspended` in the state store.
    pub async fn stop(&self) {
        let (shutdown, force) = {
            let mut lifecycle = self.lifecycle.lock().await;
            if !lifecycle.running {
                return;
            }
            lifecycle.running = false;
            (lifecycle.shutdown.clone(), lifecycle.force.clone())
        };

        let mut tasks: Vec<(InstanceId, Option<JoinHandle<InstanceState>>)> = self
            .instances
            .lock()
            .await
            .drain()
            .map(|(id, handle)| (id, Some(handle.task)))
            .collect();
        tracing::info!(instances = tasks.len(), "Stopping workflow host");
        shutdown.cancel();

        let graceful = tokio::time::timeout(self.config.shutdown_timeout(), async {
            for (_, slot) in tasks.iter_mut() {
                if let Some(task) = slot.as_mut() {
                    let _ = task.await;
                }
                *slot = None;
            }
        })
        .await;

        if graceful.is_err() {
            tracing::warn!(
                timeout_ms = self.config.shutdown_timeout_ms,
                "Shutdown timeout elapsed, aborting in-flight steps"
            );
            force.cancel();
            for (id, slot) in tasks.iter_mut() {
                if let Some(task) = slot.take() {
                    if let Err(e) = task.await {
                        tracing::error!(instance = %id, error = %e, "Instance task failed during shutdown");
                    }
                }
            }
        }
        tracing::info!("Workflow host stopped");
    }

    /// Start an instance of the latest registered version. Returns as soon as
    /// the instance is queued.
    pub async fn start_workflow(&self, id: &str, input: ContextData) -> Result<InstanceId, FlowError> {
        let definition = self.definition(id, None).await?;
        self.launch(definition, input).await
    }

    pub async fn start_workflow_version(
        &self,
        id: &str,
        version: u32,
        input: ContextData,
    ) -> Result<InstanceId, FlowError> {
        let definition = self.definition(id, Some(version)).await?;
        self.launch(definition, input).await
    }

    async fn launch(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: ContextData,
    ) -> Result<InstanceId, FlowError> {
        let state = InstanceState::new(
            definition.id(),
            definition.version(),
            definition.entry().index(),
            input,
        );
        let instance_id = state.id;

        let tokens = self.lifecycle_tokens().await?;
        self.store.save(&state).await?;
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            instance_id,
            workflow_id: state.workflow_id.clone(),
            version: state.version,
            timestamp: Utc::now(),
        });
        tracing::info!(
            instance = %instance_id,
            workflow = %definition.id(),
            version = definition.version(),
            "Starting workflow instance"
        );

        self.spawn_instance(definition, state, tokens).await;
        Ok(instance_id)
    }

    /// Bring a `Suspended` instance from the state store back under a live
    /// task. Interrupted steps run again.
    pub async fn resume_instance(&self, instance_id: InstanceId) -> Result<(), FlowError> {
        let mut state = self.store.load(instance_id).await?;
        if state.status != WorkflowStatus::Suspended {
            return Err(WorkflowError::InstanceNotActive(instance_id.to_string()).into());
        }
        if !state.ready.is_empty() {
            state.status = WorkflowStatus::Running;
        }
        let definition = self
            .definition(&state.workflow_id, Some(state.version))
            .await?;
        let tokens = self.lifecycle_tokens().await?;
        tracing::info!(instance = %instance_id, ready = state.ready.len(), parked = state.parked.len(), "Reviving instance");
        self.event_bus.emit(ExecutionEvent::WorkflowResumed {
            instance_id,
            token: None,
            timestamp: Utc::now(),
        });
        self.spawn_instance(definition, state, tokens).await;
        Ok(())
    }

    /// Shutdown and force tokens of the current run; nothing may be saved or
    /// spawned while the host is stopped.
    async fn lifecycle_tokens(&self) -> Result<(CancellationToken, CancellationToken), WorkflowError> {
        let lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return Err(WorkflowError::HostNotRunning);
        }
        Ok((lifecycle.shutdown.clone(), lifecycle.force.clone()))
    }

    async fn spawn_instance(
        &self,
        definition: Arc<WorkflowDefinition>,
        state: InstanceState,
        (shutdown, force): (CancellationToken, CancellationToken),
    ) {
        let instance_id = state.id;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(state.status);
        let control = Control {
            commands: command_rx,
            status: status_tx,
            shutdown,
            force,
        };

        let task = tokio::spawn(self.scheduler.clone().run(definition, state, control));

        let mut instances = self.instances.lock().await;
        instances.retain(|_, handle| !handle.task.is_finished());
        instances.insert(
            instance_id,
            InstanceHandle {
                commands: command_tx,
                status: status_rx,
                task,
            },
        );
    }

    /// Deliver an external event to a branch parked on `token`
    pub async fn resume(
        &self,
        instance_id: InstanceId,
        token: &str,
        payload: Option<Value>,
    ) -> Result<(), FlowError> {
        let (reply, response) = oneshot::channel();
        self.send(
            instance_id,
            Command::Resume {
                token: token.to_string(),
                payload,
                reply,
            },
        )
        .await?;
        response
            .await
            .map_err(|_| WorkflowError::InstanceNotActive(instance_id.to_string()))??;
        Ok(())
    }

    /// Terminate every branch of an instance
    pub async fn cancel(&self, instance_id: InstanceId) -> Result<(), FlowError> {
        let (reply, response) = oneshot::channel();
        self.send(instance_id, Command::Cancel { reply }).await?;
        response
            .await
            .map_err(|_| WorkflowError::InstanceNotActive(instance_id.to_string()))??;
        Ok(())
    }

    async fn send(&self, instance_id: InstanceId, command: Command) -> Result<(), FlowError> {
        let sender = {
            let instances = self.instances.lock().await;
            match instances.get(&instance_id) {
                Some(handle) => handle.commands.clone(),
                None => {
                    // distinguish a finished instance from an unknown one
                    self.store.load(instance_id).await.map_err(|_| {
                        WorkflowError::InstanceNotFound(instance_id.to_string())
                    })?;
                    return Err(WorkflowError::InstanceNotActive(instance_id.to_string()).into());
                }
            }
        };
        sender
            .send(command)
            .await
            .map_err(|_| WorkflowError::InstanceNotActive(instance_id.to_string()).into())
    }

    /// Latest persisted snapshot of an instance
    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceState, FlowError> {
        Ok(self.store.load(instance_id).await?)
    }

    /// Wait until the instance leaves `Running`, then return its snapshot
    pub async fn wait_for(
        &self,
        instance_id: InstanceId,
        timeout: Duration,
    ) -> Result<InstanceState, FlowError> {
        let receiver = {
            let instances = self.instances.lock().await;
            instances.get(&instance_id).map(|h| h.status.clone())
        };

        if let Some(mut status) = receiver {
            let settled = tokio::time::timeout(
                timeout,
                status.wait_for(|s| *s != WorkflowStatus::Running),
            )
            .await
            .map_err(|_| WorkflowError::WaitTimeout(instance_id.to_string()))?
            .map(|_| ());
            // a closed channel means the task ended; the store has its last word
            if let Err(e) = settled {
                tracing::debug!(instance = %instance_id, error = %e, "Status channel closed");
            }
        }

        self.get_instance(instance_id).await
    }
}
