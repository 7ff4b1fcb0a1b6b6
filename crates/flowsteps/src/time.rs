use async_trait::async_trait;
use flowcore::{Step, StepContext, StepError, StepOutcome};
use flowruntime::{PropertyDefinition, StepFactory, StepMetadata};
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration
pub struct DelayStep;

#[async_trait]
impl Step for DelayStep {
    fn step_type(&self) -> &str {
        "time.delay"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let delay_ms = match ctx.inputs.get("delay_ms") {
            Some(value) => value
                .as_f64()
                .filter(|ms| *ms >= 0.0)
                .ok_or_else(|| StepError::InvalidInputType {
                    field: "delay_ms".to_string(),
                    expected: "non-negative number".to_string(),
                    actual: value.to_string(),
                })? as u64,
            None => {
                ctx.events
                    .warn(format!("delay_ms not set, using {}ms", DEFAULT_DELAY_MS));
                DEFAULT_DELAY_MS
            }
        };

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => Ok(StepOutcome::Next),
            _ = ctx.cancellation.cancelled() => Err(StepError::Cancelled),
        }
    }
}

pub struct DelayFactory;

impl StepFactory for DelayFactory {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(DelayStep))
    }

    fn step_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![PropertyDefinition {
                name: "delay_ms".to_string(),
                description: "Milliseconds to wait (default 1000)".to_string(),
                required: false,
            }],
        }
    }
}
