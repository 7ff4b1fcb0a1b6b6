use crate::context::{ContextData, ExecutionContext, ScopeFrame};
use crate::step::Suspension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type InstanceId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Running,
    Suspended,
    Completed,
    Faulted,
    /// Cancelled from outside.
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Faulted | WorkflowStatus::Terminated
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Suspended => "suspended",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Faulted => "faulted",
            WorkflowStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Position of one active branch in the definition graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub id: u64,
    /// Graph node index the cursor is about to execute.
    pub node: usize,
    /// Enclosing parallel blocks, outermost first.
    pub scope: Vec<ScopeFrame>,
    /// Branch-private writes; always empty for top-level cursors.
    pub overlay: ContextData,
    /// Set while the cursor is parked on a suspension.
    pub suspension: Option<Suspension>,
}

/// Snapshot of one workflow instance, as persisted by the state store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: InstanceId,
    pub workflow_id: String,
    pub version: u32,
    pub status: WorkflowStatus,
    pub context: ExecutionContext,
    /// Cursors waiting to be dispatched (including interrupted ones).
    pub ready: Vec<Cursor>,
    /// Cursors suspended by a step, waiting for a resume token.
    pub parked: Vec<Cursor>,
    pub error: Option<String>,
    pub steps_completed: u64,
    pub next_cursor: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceState {
    pub fn new(workflow_id: impl Into<String>, version: u32, entry: usize, input: ContextData) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            version,
            status: WorkflowStatus::Running,
            context: ExecutionContext::new(input),
            ready: vec![Cursor {
                id: 0,
                node: entry,
                scope: Vec::new(),
                overlay: ContextData::new(),
                suspension: None,
            }],
            parked: Vec::new(),
            error: None,
            steps_completed: 0,
            next_cursor: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Base context data.
    pub fn data(&self) -> &ContextData {
        &self.context.data
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn new_cursor(&mut self, node: usize, scope: Vec<ScopeFrame>, overlay: ContextData) -> Cursor {
        let id = self.next_cursor;
        self.next_cursor += 1;
        Cursor {
            id,
            node,
            scope,
            overlay,
            suspension: None,
        }
    }

    pub fn resume_tokens(&self) -> Vec<String> {
        self.parked
            .iter()
            .filter_map(|c| c.suspension.as_ref().map(|s| s.token.clone()))
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
