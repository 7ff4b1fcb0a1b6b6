use async_trait::async_trait;
use flowcore::{Step, StepContext, StepError, StepOutcome, Value};
use flowruntime::{PropertyDefinition, StepFactory, StepMetadata};

const DEFAULT_OUTPUT: &str = "event_data";

/// Parks the branch until the host is resumed with the event's token.
///
/// The token is `event_name`, or `event_name:event_key` when a key is given.
/// The resume payload is stored under `output` (default `event_data`).
pub struct WaitForEventStep;

#[async_trait]
impl Step for WaitForEventStep {
    fn step_type(&self) -> &str {
        "event.wait"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let name = ctx.require_str("event_name")?.to_string();
        let token = match ctx.inputs.get("event_key").and_then(|v| v.as_str()) {
            Some(key) => format!("{}:{}", name, key),
            None => name,
        };
        let output = ctx
            .inputs
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_OUTPUT)
            .to_string();

        tracing::info!(instance = %ctx.instance_id, token = %token, "Waiting for event");
        ctx.events.info(format!("Waiting for event '{}'", token));
        ctx.events.data("resume_token", Value::from(token.as_str()));
        Ok(StepOutcome::suspend_into(token, output))
    }
}

pub struct WaitForEventFactory;

impl StepFactory for WaitForEventFactory {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(WaitForEventStep))
    }

    fn step_type(&self) -> &str {
        "event.wait"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Suspend until an external event is published".to_string(),
            category: "event".to_string(),
            inputs: vec![
                PropertyDefinition {
                    name: "event_name".to_string(),
                    description: "Event to wait for".to_string(),
                    required: true,
                },
                PropertyDefinition {
                    name: "event_key".to_string(),
                    description: "Narrows the token to one occurrence of the event".to_string(),
                    required: false,
                },
                PropertyDefinition {
                    name: "output".to_string(),
                    description: "Context field receiving the event payload".to_string(),
                    required: false,
                },
            ],
        }
    }
}
