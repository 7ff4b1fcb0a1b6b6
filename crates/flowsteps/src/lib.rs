//! Standard step library
//!
//! Built-in steps for the sample workflows: greetings and message printing,
//! context logging, delays and waiting for an external event.

mod debug;
mod event;
mod print;
mod time;

pub use debug::LogContextStep;
pub use event::WaitForEventStep;
pub use print::{PrintMessageStep, SayGoodbyeStep, SayHelloStep};
pub use time::DelayStep;
use flowruntime::StepRegistry;

use std::sync::Arc;

/// Register all standard steps with a registry
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(Arc::new(print::SayHelloFactory));
    registry.register(Arc::new(print::PrintMessageFactory));
    registry.register(Arc::new(print::SayGoodbyeFactory));
    registry.register(Arc::new(debug::LogContextFactory));
    registry.register(Arc::new(time::DelayFactory));
    registry.register(Arc::new(event::WaitForEventFactory));
}
