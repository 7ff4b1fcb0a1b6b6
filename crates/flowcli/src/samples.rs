//! Sample workflow definitions run by the `flow` binary

use clap::ValueEnum;
use flowcore::{DefinitionError, Selector, StepSpec, WorkflowBuilder, WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Sample {
    /// Three parallel branches of two messages each
    Parallel,
    /// Boolean decision on `approved`
    Approval,
    /// Nested decision cascade over `value` = 0, 1 or 2
    Switch,
}

impl Sample {
    pub fn definition(self) -> Result<WorkflowDefinition, DefinitionError> {
        match self {
            Sample::Parallel => parallel(),
            Sample::Approval => approval(),
            Sample::Switch => switch(),
        }
    }
}

fn print(message: &str) -> StepSpec {
    StepSpec::new("print.message")
        .named(format!("Print {}", message))
        .input("message", message)
}

/// SayHello, three two-step branches, Join, SayGoodbye
pub fn parallel() -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowBuilder::new("parallel-sample", 1)
        .description("Three branches printing two items each")
        .start_with(StepSpec::new("say.hello").named("SayHello"))
        .parallel()
        .branch(|b| b.start_with(print("Item 1.1")).then(print("Item 1.2")))
        .branch(|b| b.start_with(print("Item 2.1")).then(print("Item 2.2")))
        .branch(|b| b.start_with(print("Item 3.1")).then(print("Item 3.2")))
        .join()
        .then(StepSpec::new("say.goodbye").named("SayGoodbye"))
        .build()
}

pub fn approval() -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowBuilder::new("approval-sample", 1)
        .description("Welcome or reject a user depending on `approved`")
        .start_with(
            StepSpec::new("print.message")
                .named("CheckUserStatus")
                .input("message", "Checking user status"),
        )
        .decide(Selector::field("approved"))
        .when(true, |b| {
            b.start_with(
                StepSpec::new("print.message")
                    .named("SendWelcomeEmail")
                    .input("message", "Sending welcome email"),
            )
        })
        .when(false, |b| {
            b.start_with(
                StepSpec::new("print.message")
                    .named("SendRejectionEmail")
                    .input("message", "Sending rejection email"),
            )
        })
        .build()
}

pub fn switch() -> Result<WorkflowDefinition, DefinitionError> {
    WorkflowBuilder::new("switch-sample", 1)
        .description("Route on `value`; anything but 0, 1 or 2 faults")
        .start_with(StepSpec::new("log.context").named("Inspect"))
        .decide(Selector::field("value"))
        .when(0, |b| b.start_with(print("zero")))
        .when(1, |b| b.start_with(print("one")))
        .otherwise(|b| {
            b.start_with(StepSpec::new("log.context").named("Cascade"))
                .decide(Selector::field("value"))
                .when(2, |b| b.start_with(print("two")))
        })
        .then(StepSpec::new("say.goodbye").named("SayGoodbye"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_build() {
        assert_eq!(parallel().unwrap().step_count(), 8);
        assert_eq!(approval().unwrap().step_count(), 3);
        assert_eq!(switch().unwrap().step_count(), 6);
    }
}
