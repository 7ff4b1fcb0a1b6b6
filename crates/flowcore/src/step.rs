use crate::context::ContextData;
use crate::events::EventEmitter;
use crate::instance::InstanceId;
use crate::{StepError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable steps implement
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique type identifier (e.g., "print.message", "time.delay")
    fn step_type(&self) -> &str;

    /// Run the step. Returning `Err` faults the step.
    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError>;
}

/// Successful result of a step run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Continue with the successor node.
    Next,
    /// Park the branch until the instance is resumed with this token.
    Suspend(Suspension),
}

impl StepOutcome {
    pub fn suspend(token: impl Into<String>) -> Self {
        StepOutcome::Suspend(Suspension {
            token: token.into(),
            output: None,
        })
    }

    /// Suspend and store the resume payload under `output`.
    pub fn suspend_into(token: impl Into<String>, output: impl Into<String>) -> Self {
        StepOutcome::Suspend(Suspension {
            token: token.into(),
            output: Some(output.into()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub token: String,
    pub output: Option<String>,
}

/// Execution context passed to each step run
pub struct StepContext {
    pub instance_id: InstanceId,

    /// Step display name from the definition
    pub step_name: String,

    /// Step properties resolved from the definition's input bindings
    pub inputs: HashMap<String, Value>,

    /// Branch-visible context at dispatch time
    pub data: ContextData,

    /// 1 for the first attempt, incremented by retries
    pub attempt: u32,

    pub events: EventEmitter,

    pub cancellation: CancellationToken,

    writes: ContextData,
}

impl StepContext {
    pub fn new(
        instance_id: InstanceId,
        step_name: impl Into<String>,
        inputs: HashMap<String, Value>,
        data: ContextData,
        events: EventEmitter,
    ) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            inputs,
            data,
            attempt: 1,
            events,
            cancellation: CancellationToken::new(),
            writes: ContextData::new(),
        }
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, StepError> {
        self.inputs
            .get(name)
            .ok_or_else(|| StepError::MissingInput(name.to_string()))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, StepError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| StepError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: type_name(value).to_string(),
        })
    }

    pub fn input_or(&self, name: &str, default: Value) -> Value {
        self.inputs.get(name).cloned().unwrap_or(default)
    }

    /// Read a context field, including this run's own writes.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.writes.get(key).or_else(|| self.data.get(key))
    }

    /// Write a context field. Writes become visible to later steps of the
    /// same branch once the step completes with `Next` or `Suspend`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.writes.insert(key.into(), value.into());
    }

    pub fn writes(&self) -> &ContextData {
        &self.writes
    }

    pub fn take_writes(&mut self) -> ContextData {
        std::mem::take(&mut self.writes)
    }

    /// Discard writes of a failed attempt before retrying.
    pub fn reset_writes(&mut self) {
        self.writes.clear();
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
