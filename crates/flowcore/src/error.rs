use crate::definition::Discriminant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(String),
}

/// Malformed workflow graph, raised by `WorkflowBuilder::build`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Workflow has no entry step (call start_with first)")]
    MissingStart,

    #[error("start_with called on a sequence that already has an entry step")]
    DuplicateStart,

    #[error("join() without a matching open parallel()")]
    JoinWithoutParallel,

    #[error("parallel() was never closed with join()")]
    UnclosedParallel,

    #[error("parallel() opened while another parallel block is still open")]
    OverlappingParallel,

    #[error("Parallel block has no branches")]
    EmptyParallel,

    #[error("Empty branch in {context}")]
    EmptyBranch { context: String },

    #[error("Decision has no branches")]
    EmptyDecision,

    #[error("{0} called outside of the matching block")]
    BranchWithoutBlock(&'static str),

    #[error("Decision already has a branch for {0}")]
    DuplicateBranch(Discriminant),

    #[error("Decision already has a default branch")]
    DuplicateDefault,

    #[error("Workflow graph contains a cycle")]
    CyclicGraph,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Unknown workflow: {id} (version {})", version.map(|v| v.to_string()).unwrap_or_else(|| "latest".to_string()))]
    UnknownWorkflow { id: String, version: Option<u32> },

    #[error("Workflow {id} version {version} is already registered")]
    AlreadyRegistered { id: String, version: u32 },

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("No branch of decision '{node}' matches {discriminant}")]
    NoMatchingBranch { node: String, discriminant: String },

    #[error("Instance {0} has no parked branch for resume token '{1}'")]
    UnknownResumeToken(String, String),

    #[error("Instance {0} is not active")]
    InstanceNotActive(String),

    #[error("Workflow host is not running")]
    HostNotRunning,

    #[error("Timed out waiting for instance {0}")]
    WaitTimeout(String),
}

/// Failure signalled by a step; this is the `Fault` outcome of a run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Step initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Instance {0} not found in state store")]
    NotFound(String),

    #[error("State store backend failure: {0}")]
    Backend(String),
}
