//! Per-instance graph walker.
//!
//! Each running instance is driven by one task that owns its
//! [`InstanceState`]. Step bodies run in spawned tasks and report back to
//! that task, so all context merges and join bookkeeping happen on a single
//! writer without locks.
//!
//! Fault policy is fail-fast: the first unrecovered step fault or unmatched
//! decision cancels every live branch of the instance, withdraws their
//! arrivals from open joins and marks the instance `Faulted`.

use crate::registry::StepRegistry;
use crate::store::StateStore;
use chrono::Utc;
use flowcore::{
    Arrival, ContextData, ContextView, Cursor, EventBus, ExecutionEvent, FlowError, GraphNode,
    InputSource, InstanceState, RetryPolicy, ScopeFrame, Step, StepContext, StepError, StepOutcome, StepSpec,
    StoreError, Value, WorkflowDefinition, WorkflowError, WorkflowStatus,
};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Requests delivered to a running instance task
pub(crate) enum Command {
    Resume {
        token: String,
        payload: Option<Value>,
        reply: oneshot::Sender<Result<(), WorkflowError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), WorkflowError>>,
    },
}

/// Channels connecting an instance task to the host
pub(crate) struct Control {
    pub commands: mpsc::Receiver<Command>,
    pub status: watch::Sender<WorkflowStatus>,
    /// Stop dispatching, let in-flight steps finish.
    pub shutdown: CancellationToken,
    /// Abort in-flight steps; their cursors are re-queued.
    pub force: CancellationToken,
}

/// What a step task hands back to the instance task
struct StepReport {
    cursor: u64,
    node: usize,
    step: String,
    result: Result<(StepOutcome, ContextData), StepError>,
    duration_ms: u64,
}

/// Shared, definition-independent scheduling services
pub struct Scheduler {
    registry: Arc<StepRegistry>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    max_parallel: usize,
}

impl Scheduler {
    pub fn new(
        registry: Arc<StepRegistry>,
        event_bus: Arc<EventBus>,
        store: Arc<dyn StateStore>,
        max_parallel: usize,
    ) -> Self {
        Self {
            registry,
            event_bus,
            store,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Drive one instance until it reaches a terminal status or the host
    /// shuts down. Returns the final snapshot, which has also been saved.
    pub(crate) async fn run(
        self: Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        state: InstanceState,
        control: Control,
    ) -> InstanceState {
        let execution = Execution {
            scheduler: self,
            definition,
            state,
            running: FuturesUnordered::new(),
            in_flight: HashMap::new(),
            cancel: CancellationToken::new(),
            status_tx: control.status,
            started: Instant::now(),
            store_failure: None,
        };
        execution
            .drive(control.commands, control.shutdown, control.force)
            .await
    }
}

struct Execution {
    scheduler: Arc<Scheduler>,
    definition: Arc<WorkflowDefinition>,
    state: InstanceState,
    running: FuturesUnordered<JoinHandle<StepReport>>,
    in_flight: HashMap<u64, Cursor>,
    cancel: CancellationToken,
    status_tx: watch::Sender<WorkflowStatus>,
    started: Instant,
    /// First failed save; the instance faults before doing more work.
    store_failure: Option<StoreError>,
}

impl Execution {
    async fn drive(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) -> InstanceState {
        let instance_id = self.state.id;
        tracing::info!(
            instance = %instance_id,
            workflow = %self.state.workflow_id,
            version = self.state.version,
            "Workflow instance running"
        );
        self.checkpoint().await;

        let mut draining = false;
        let mut commands_open = true;

        loop {
            if self.fault_on_store_failure().await {
                break;
            }
            if !draining {
                if let Err(e) = self.dispatch() {
                    self.terminate(WorkflowStatus::Faulted, Some(e.to_string())).await;
                    break;
                }
            }

            if self.running.is_empty() {
                if self.state.ready.is_empty() && self.state.parked.is_empty() {
                    if self.state.context.joins.is_empty() {
                        self.complete().await;
                    } else {
                        let detail = "Branches stalled before reaching their join".to_string();
                        self.terminate(WorkflowStatus::Faulted, Some(detail)).await;
                    }
                    break;
                }
                if draining {
                    tracing::info!(instance = %instance_id, "Instance suspended by host shutdown");
                    self.suspend().await;
                    break;
                }
                if self.state.ready.is_empty() && self.state.status != WorkflowStatus::Suspended {
                    self.suspend().await;
                    if self.fault_on_store_failure().await {
                        break;
                    }
                }
            }

            tokio::select! {
                Some(joined) = self.running.next(), if !self.running.is_empty() => {
                    if let Err(detail) = self.handle_report(joined) {
                        self.terminate(WorkflowStatus::Faulted, Some(detail)).await;
                        break;
                    }
                    self.checkpoint().await;
                }
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Resume { token, payload, reply }) => {
                        let result = if draining {
                            Err(WorkflowError::HostNotRunning)
                        } else {
                            self.resume(&token, payload)
                        };
                        if result.is_ok() {
                            self.checkpoint().await;
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Cancel { reply }) => {
                        tracing::info!(instance = %instance_id, "Instance cancelled");
                        self.terminate(WorkflowStatus::Terminated, Some("Cancelled".to_string())).await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    None => {
                        commands_open = false;
                        draining = true;
                    }
                },
                _ = shutdown.cancelled(), if !draining => {
                    tracing::debug!(instance = %instance_id, in_flight = self.running.len(), "Draining instance");
                    draining = true;
                }
                _ = force.cancelled(), if draining && !self.running.is_empty() => {
                    tracing::warn!(
                        instance = %instance_id,
                        in_flight = self.running.len(),
                        "Aborting in-flight steps after shutdown timeout"
                    );
                    self.abort_in_flight();
                    let interrupted: Vec<Cursor> = self.in_flight.drain().map(|(_, c)| c).collect();
                    self.state.ready.extend(interrupted);
                }
                else => {
                    draining = true;
                }
            }
        }

        self.state
    }

    /// Walk every ready cursor forward until it sits on a step, then start
    /// steps while capacity allows.
    fn dispatch(&mut self) -> Result<(), FlowError> {
        let definition = Arc::clone(&self.definition);
        let mut queue: VecDeque<Cursor> = self.state.ready.drain(..).collect();
        let mut deferred = Vec::new();

        while let Some(mut cursor) = queue.pop_front() {
            let idx = NodeIndex::new(cursor.node);
            let node = definition
                .node(idx)
                .ok_or_else(|| FlowError::Execution(format!("Graph node {} does not exist", cursor.node)))?;

            match node {
                GraphNode::Step(spec) => {
                    if self.running.len() >= self.scheduler.max_parallel {
                        deferred.push(cursor);
                    } else {
                        self.start_step(cursor, spec)?;
                    }
                }
                &GraphNode::Split { join, branches } => {
                    let heads = definition.branch_heads(idx);
                    let parent_scope = cursor.scope.clone();
                    let split = self.state.context.fork(
                        cursor.node,
                        join.index(),
                        branches,
                        parent_scope.clone(),
                        std::mem::take(&mut cursor.overlay),
                    );
                    for (branch, head) in heads.into_iter().enumerate() {
                        let mut scope = parent_scope.clone();
                        scope.push(ScopeFrame { split, branch });
                        let child = self.state.new_cursor(head.index(), scope, ContextData::new());
                        queue.push_back(child);
                    }
                    tracing::debug!(instance = %self.state.id, node = cursor.node, branches, "Forked branches");
                    self.emit(ExecutionEvent::BranchesForked {
                        instance_id: self.state.id,
                        node: cursor.node,
                        branches,
                        timestamp: Utc::now(),
                    });
                }
                &GraphNode::Join { branches, .. } => {
                    let frame = *cursor.scope.last().ok_or_else(|| {
                        FlowError::Execution(format!("Cursor reached join {} outside of its split", cursor.node))
                    })?;
                    match self.state.context.arrive(frame, std::mem::take(&mut cursor.overlay)) {
                        Some(Arrival::Waiting { arrived, branches }) => {
                            tracing::debug!(
                                instance = %self.state.id,
                                node = cursor.node,
                                arrived,
                                branches,
                                "Branch waiting at join"
                            );
                        }
                        Some(Arrival::Released(release)) => {
                            tracing::debug!(instance = %self.state.id, node = cursor.node, branches, "Join released");
                            self.emit(ExecutionEvent::BranchesJoined {
                                instance_id: self.state.id,
                                node: cursor.node,
                                branches,
                                conflicts: release.conflicts.clone(),
                                timestamp: Utc::now(),
                            });
                            let mut overlay = release.overlay;
                            if release.scope.is_empty() {
                                self.state.context.commit(std::mem::take(&mut overlay));
                            }
                            let merged = self.state.new_cursor(release.join_node, release.scope, overlay);
                            if let Some(next) = self.advance(merged)? {
                                queue.push_back(next);
                            }
                        }
                        None => {
                            tracing::debug!(instance = %self.state.id, node = cursor.node, "Dropping cursor of a closed split");
                        }
                    }
                }
                GraphNode::Decision { selector } => {
                    let view: ContextView<'_> = self.state.context.view(&cursor.scope, &cursor.overlay);
                    let value = selector.evaluate(&view);
                    let target = match &value {
                        Some(v) => definition.route(idx, v),
                        None => definition.default_route(idx),
                    };
                    let shown = value.as_ref().map(|v| v.to_string());
                    self.emit(ExecutionEvent::DecisionTaken {
                        instance_id: self.state.id,
                        node: cursor.node,
                        discriminant: shown.clone(),
                        timestamp: Utc::now(),
                    });
                    let target = target.ok_or_else(|| WorkflowError::NoMatchingBranch {
                        node: selector.label().to_string(),
                        discriminant: shown.unwrap_or_else(|| "no value".to_string()),
                    })?;
                    tracing::debug!(
                        instance = %self.state.id,
                        node = cursor.node,
                        selector = selector.label(),
                        "Decision routed"
                    );
                    cursor.node = target.index();
                    queue.push_front(cursor);
                }
            }
        }

        self.state.ready = deferred;
        Ok(())
    }

    /// Move a cursor past its current node. Returns `None` once a top-level
    /// cursor runs off the end of the graph.
    fn advance(&mut self, mut cursor: Cursor) -> Result<Option<Cursor>, FlowError> {
        match self.definition.next(NodeIndex::new(cursor.node)) {
            Some(next) => {
                cursor.node = next.index();
                Ok(Some(cursor))
            }
            None if cursor.scope.is_empty() => {
                self.state.context.commit(cursor.overlay);
                Ok(None)
            }
            None => Err(FlowError::Execution(format!(
                "Branch ended at node {} without reaching its join",
                cursor.node
            ))),
        }
    }

    fn start_step(&mut self, cursor: Cursor, spec: &StepSpec) -> Result<(), FlowError> {
        let step = self.scheduler.registry.create_step(&spec.step_type)?;
        let view = self.state.context.view(&cursor.scope, &cursor.overlay);
        let inputs = resolve_inputs(spec, &view);
        let name = spec.display_name().to_string();

        let mut ctx = StepContext::new(
            self.state.id,
            name.clone(),
            inputs,
            view.snapshot(),
            self.scheduler.event_bus.create_emitter(self.state.id, name.clone()),
        );
        ctx.cancellation = self.cancel.child_token();

        let task = run_step(
            step,
            ctx,
            spec.retry_policy.clone(),
            self.scheduler.event_bus.clone(),
            cursor.id,
            cursor.node,
        );
        self.running.push(tokio::spawn(task));
        self.in_flight.insert(cursor.id, cursor);
        Ok(())
    }

    fn handle_report(&mut self, joined: Result<StepReport, JoinError>) -> Result<(), String> {
        let report = joined.map_err(|e| format!("Step task failed: {}", e))?;
        let mut cursor = self
            .in_flight
            .remove(&report.cursor)
            .ok_or_else(|| format!("Report for unknown cursor {}", report.cursor))?;

        match report.result {
            Ok((outcome, writes)) => {
                self.state
                    .context
                    .apply_writes(&cursor.scope, &mut cursor.overlay, writes);
                match outcome {
                    StepOutcome::Next => {
                        tracing::debug!(
                            instance = %self.state.id,
                            step = %report.step,
                            duration_ms = report.duration_ms,
                            "Step completed"
                        );
                        self.state.steps_completed += 1;
                        self.emit(ExecutionEvent::StepCompleted {
                            instance_id: self.state.id,
                            node: report.node,
                            step: report.step,
                            duration_ms: report.duration_ms,
                            timestamp: Utc::now(),
                        });
                        if let Some(next) = self.advance(cursor).map_err(|e| e.to_string())? {
                            self.state.ready.push(next);
                        }
                    }
                    StepOutcome::Suspend(suspension) => {
                        tracing::info!(
                            instance = %self.state.id,
                            step = %report.step,
                            token = %suspension.token,
                            "Step suspended"
                        );
                        cursor.suspension = Some(suspension);
                        self.state.parked.push(cursor);
                    }
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(instance = %self.state.id, step = %report.step, error = %e, "Step failed");
                self.emit(ExecutionEvent::StepFailed {
                    instance_id: self.state.id,
                    node: report.node,
                    step: report.step.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                // fail-fast: the cursor is gone, siblings are cancelled by terminate()
                self.state.context.withdraw(&cursor.scope);
                Err(format!("Step '{}' failed: {}", report.step, e))
            }
        }
    }

    fn resume(&mut self, token: &str, payload: Option<Value>) -> Result<(), WorkflowError> {
        let position = self
            .state
            .parked
            .iter()
            .position(|c| c.suspension.as_ref().is_some_and(|s| s.token == token))
            .ok_or_else(|| WorkflowError::UnknownResumeToken(self.state.id.to_string(), token.to_string()))?;

        let mut cursor = self.state.parked.remove(position);
        if let Some(suspension) = cursor.suspension.take() {
            if let (Some(key), Some(value)) = (suspension.output, payload) {
                let writes = ContextData::from([(key, value)]);
                self.state
                    .context
                    .apply_writes(&cursor.scope, &mut cursor.overlay, writes);
            }
        }
        self.state.steps_completed += 1;

        match self.advance(cursor) {
            Ok(Some(next)) => self.state.ready.push(next),
            Ok(None) => {}
            Err(e) => return Err(WorkflowError::InstanceNotActive(e.to_string())),
        }

        tracing::info!(instance = %self.state.id, token, "Instance resumed");
        self.set_status(WorkflowStatus::Running);
        self.emit(ExecutionEvent::WorkflowResumed {
            instance_id: self.state.id,
            token: Some(token.to_string()),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn abort_in_flight(&mut self) {
        self.cancel.cancel();
        for handle in self.running.iter() {
            handle.abort();
        }
        self.running.clear();
    }

    /// Stop every branch and settle on a terminal status.
    async fn terminate(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.abort_in_flight();
        let live: Vec<Cursor> = self
            .in_flight
            .drain()
            .map(|(_, c)| c)
            .chain(self.state.ready.drain(..))
            .chain(self.state.parked.drain(..))
            .collect();
        for cursor in &live {
            self.state.context.withdraw(&cursor.scope);
        }
        self.state.context.close_all_joins();

        if let Some(detail) = &error {
            tracing::error!(instance = %self.state.id, status = %status, error = %detail, "Workflow instance stopped");
        }
        self.state.error = error;
        self.set_status(status);
        self.checkpoint().await;
        self.finish_event();
    }

    async fn complete(&mut self) {
        tracing::info!(
            instance = %self.state.id,
            steps = self.state.steps_completed,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Workflow instance completed"
        );
        self.set_status(WorkflowStatus::Completed);
        self.checkpoint().await;
        self.finish_event();
    }

    async fn suspend(&mut self) {
        self.set_status(WorkflowStatus::Suspended);
        self.checkpoint().await;
        self.emit(ExecutionEvent::WorkflowSuspended {
            instance_id: self.state.id,
            tokens: self.state.resume_tokens(),
            timestamp: Utc::now(),
        });
    }

    fn finish_event(&self) {
        self.emit(ExecutionEvent::WorkflowCompleted {
            instance_id: self.state.id,
            status: self.state.status,
            error: self.state.error.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }

    fn set_status(&mut self, status: WorkflowStatus) {
        self.state.status = status;
    }

    /// Save the snapshot, then publish its status to watchers so a waiter
    /// never loads an older snapshot than the status it observed.
    async fn checkpoint(&mut self) {
        self.state.touch();
        if let Err(e) = self.scheduler.store.save(&self.state).await {
            tracing::error!(instance = %self.state.id, error = %e, "Failed to persist instance state");
            self.store_failure.get_or_insert(e);
        }
        self.status_tx.send_replace(self.state.status);
    }

    /// An instance whose snapshots cannot be saved is no longer resumable;
    /// stop it as `Faulted`. Returns true when it did.
    async fn fault_on_store_failure(&mut self) -> bool {
        match self.store_failure.take() {
            Some(e) => {
                let detail = format!("State store failure: {}", e);
                self.terminate(WorkflowStatus::Faulted, Some(detail)).await;
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        self.scheduler.event_bus.emit(event);
    }
}

/// Evaluate a step's input bindings against the branch view. Bindings to
/// missing context fields are left out; the step decides whether it needs them.
fn resolve_inputs(spec: &StepSpec, view: &ContextView<'_>) -> HashMap<String, Value> {
    spec.inputs
        .iter()
        .filter_map(|binding| {
            let value = match &binding.source {
                InputSource::Constant(v) => Some(v.clone()),
                InputSource::Context(key) => view.get(key).cloned(),
            };
            value.map(|v| (binding.property.clone(), v))
        })
        .collect()
}

async fn run_step(
    step: Box<dyn Step>,
    mut ctx: StepContext,
    retry: Option<RetryPolicy>,
    event_bus: Arc<EventBus>,
    cursor: u64,
    node: usize,
) -> StepReport {
    let start = Instant::now();
    let max_attempts = retry.as_ref().map_or(1, |p| p.max_attempts.max(1));
    let token = ctx.cancellation.clone();
    let name = ctx.step_name.clone();

    let result = loop {
        event_bus.emit(ExecutionEvent::StepStarted {
            instance_id: ctx.instance_id,
            node,
            step: name.clone(),
            attempt: ctx.attempt,
            timestamp: Utc::now(),
        });

        let outcome = tokio::select! {
            r = step.run(&mut ctx) => r,
            _ = token.cancelled() => Err(StepError::Cancelled),
        };

        match outcome {
            Ok(outcome) => break Ok((outcome, ctx.take_writes())),
            Err(StepError::Cancelled) => break Err(StepError::Cancelled),
            Err(e) if ctx.attempt < max_attempts => {
                let delay = retry
                    .as_ref()
                    .map(|p| p.delay_for(ctx.attempt))
                    .unwrap_or_default();
                tracing::warn!(
                    step = %name,
                    attempt = ctx.attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Step failed, retrying"
                );
                event_bus.emit(ExecutionEvent::StepRetrying {
                    instance_id: ctx.instance_id,
                    node,
                    step: name.clone(),
                    attempt: ctx.attempt,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                ctx.reset_writes();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => break Err(StepError::Cancelled),
                }
                ctx.attempt += 1;
            }
            Err(e) => break Err(e),
        }
    };

    StepReport {
        cursor,
        node,
        step: name,
        result,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
