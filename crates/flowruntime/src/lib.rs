//! Workflow execution runtime
//!
//! This crate hosts registered workflow definitions, walks their graphs with
//! one scheduler task per instance, and keeps the step registry and the
//! instance state store.

mod config;
mod host;
mod registry;
mod scheduler;
mod store;

pub use config::{ConfigError, HostConfig};
pub use host::WorkflowHost;
pub use registry::{FnStep, PropertyDefinition, StepFactory, StepMetadata, StepRegistry};
pub use scheduler::Scheduler;
pub use store::{MemoryStateStore, StateStore};
