use async_trait::async_trait;
use flowcore::{Step, StepContext, StepError, StepOutcome};
use flowruntime::{StepFactory, StepMetadata};

/// Logs the branch-visible context and the resolved inputs
pub struct LogContextStep;

#[async_trait]
impl Step for LogContextStep {
    fn step_type(&self) -> &str {
        "log.context"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        tracing::debug!(
            instance = %ctx.instance_id,
            step = %ctx.step_name,
            fields = ctx.data.len(),
            "Context snapshot"
        );
        ctx.events.info(format!("DEBUG: {} context field(s)", ctx.data.len()));

        for (key, value) in &ctx.data {
            ctx.events.info(format!("  {}: {}", key, value));
        }
        let mut inputs: Vec<_> = ctx.inputs.iter().collect();
        inputs.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in inputs {
            ctx.events.info(format!("  input {}: {}", key, value));
        }

        Ok(StepOutcome::Next)
    }
}

pub struct LogContextFactory;

impl StepFactory for LogContextFactory {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(LogContextStep))
    }

    fn step_type(&self) -> &str {
        "log.context"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Logs context values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![],
        }
    }
}
