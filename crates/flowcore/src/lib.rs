//! Core abstractions for the flow engine
//!
//! Workflow definitions and their builder, the step contract, the
//! per-instance execution context, instance state and execution events.
//! Nothing in this crate schedules work; see `flowruntime` for that.

mod builder;
pub mod context;
mod definition;
mod error;
pub mod events;
mod instance;
mod step;
mod value;

pub use builder::WorkflowBuilder;
pub use context::{
    merge_overlays, Arrival, ContextData, ContextView, ExecutionContext, JoinRelease, JoinState,
    ScopeFrame, SplitId,
};
pub use definition::{
    Discriminant, GraphNode, InputBinding, InputSource, RetryPolicy, Selector, StepSpec,
    Transition, WorkflowDefinition,
};
pub use error::{DefinitionError, FlowError, StepError, StoreError, WorkflowError};
pub use events::*;
pub use instance::{Cursor, InstanceId, InstanceState, WorkflowStatus};
pub use step::{Step, StepContext, StepOutcome, Suspension};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
