use crate::instance::{InstanceId, WorkflowStatus};
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        instance_id: InstanceId,
        workflow_id: String,
        version: u32,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        instance_id: InstanceId,
        status: WorkflowStatus,
        error: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowSuspended {
        instance_id: InstanceId,
        tokens: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        instance_id: InstanceId,
        token: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        instance_id: InstanceId,
        node: usize,
        step: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        instance_id: InstanceId,
        node: usize,
        step: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepRetrying {
        instance_id: InstanceId,
        node: usize,
        step: String,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        instance_id: InstanceId,
        node: usize,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    BranchesForked {
        instance_id: InstanceId,
        node: usize,
        branches: usize,
        timestamp: DateTime<Utc>,
    },
    BranchesJoined {
        instance_id: InstanceId,
        node: usize,
        branches: usize,
        conflicts: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    DecisionTaken {
        instance_id: InstanceId,
        node: usize,
        discriminant: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StepEvent {
        instance_id: InstanceId,
        step: String,
        event: StepEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            ExecutionEvent::WorkflowStarted { instance_id, .. }
            | ExecutionEvent::WorkflowCompleted { instance_id, .. }
            | ExecutionEvent::WorkflowSuspended { instance_id, .. }
            | ExecutionEvent::WorkflowResumed { instance_id, .. }
            | ExecutionEvent::StepStarted { instance_id, .. }
            | ExecutionEvent::StepCompleted { instance_id, .. }
            | ExecutionEvent::StepRetrying { instance_id, .. }
            | ExecutionEvent::StepFailed { instance_id, .. }
            | ExecutionEvent::BranchesForked { instance_id, .. }
            | ExecutionEvent::BranchesJoined { instance_id, .. }
            | ExecutionEvent::DecisionTaken { instance_id, .. }
            | ExecutionEvent::StepEvent { instance_id, .. } => *instance_id,
        }
    }
}

/// Events a step reports about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { key: String, value: Value },
}

/// Event emitter for steps to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    instance_id: InstanceId,
    step: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        instance_id: InstanceId,
        step: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            instance_id,
            step: step.into(),
            sender,
        }
    }

    /// Publish a step event tagged with this emitter's instance and step.
    pub fn emit(&self, event: StepEvent) {
        let _ = self.sender.send(ExecutionEvent::StepEvent {
            instance_id: self.instance_id,
            step: self.step.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Informational message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(StepEvent::Info {
            message: message.into(),
        });
    }

    /// Warning that does not fail the step
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StepEvent::Warning {
            message: message.into(),
        });
    }

    /// Progress update, `percent` in 0..=100
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(StepEvent::Progress { percent, message });
    }

    /// Named value for subscribers, such as a resume token
    pub fn data(&self, key: impl Into<String>, value: Value) {
        self.emit(StepEvent::Data {
            key: key.into(),
            value,
        });
    }
}

/// Process-wide event bus; sends never block and are dropped without subscribers
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    /// Emitter bound to one step of one instance
    pub fn create_emitter(&self, instance_id: InstanceId, step: impl Into<String>) -> EventEmitter {
        EventEmitter::new(instance_id, step, self.sender.clone())
    }
}
