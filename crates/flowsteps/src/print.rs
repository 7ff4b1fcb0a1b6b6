use async_trait::async_trait;
use flowcore::{Step, StepContext, StepError, StepOutcome};
use flowruntime::{PropertyDefinition, StepFactory, StepMetadata};

/// Prints a greeting
pub struct SayHelloStep;

#[async_trait]
impl Step for SayHelloStep {
    fn step_type(&self) -> &str {
        "say.hello"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        println!("Hello!");
        ctx.events.info("Hello!");
        Ok(StepOutcome::Next)
    }
}

pub struct SayHelloFactory;

impl StepFactory for SayHelloFactory {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(SayHelloStep))
    }

    fn step_type(&self) -> &str {
        "say.hello"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Prints a greeting".to_string(),
            category: "print".to_string(),
            inputs: vec![],
        }
    }
}

/// Prints its `message` input
pub struct PrintMessageStep;

#[async_trait]
impl Step for PrintMessageStep {
    fn step_type(&self) -> &str {
        "print.message"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let message = ctx.require_input("message")?.to_string();

        println!("{}", message);
        ctx.events.info(message);
        Ok(StepOutcome::Next)
    }
}

pub struct PrintMessageFactory;

impl StepFactory for PrintMessageFactory {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(PrintMessageStep))
    }

    fn step_type(&self) -> &str {
        "print.message"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Prints a message".to_string(),
            category: "print".to_string(),
            inputs: vec![PropertyDefinition {
                name: "message".to_string(),
                description: "Text to print; non-string values are rendered".to_string(),
                required: true,
            }],
        }
    }
}

/// Prints a farewell
pub struct SayGoodbyeStep;

#[async_trait]
impl Step for SayGoodbyeStep {
    fn step_type(&self) -> &str {
        "say.goodbye"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        println!("Goodbye!");
        ctx.events.info("Goodbye!");
        Ok(StepOutcome::Next)
    }
}

pub struct SayGoodbyeFactory;

impl StepFactory for SayGoodbyeFactory {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(SayGoodbyeStep))
    }

    fn step_type(&self) -> &str {
        "say.goodbye"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Prints a farewell".to_string(),
            category: "print".to_string(),
            inputs: vec![],
        }
    }
}
