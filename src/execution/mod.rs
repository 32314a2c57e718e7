//! Execution engine - drives node and plan executions through their state machine

pub mod engine;
pub mod events;

mod advising;
mod interrupts;
mod resume;
mod runner;

pub use engine::{EngineBuilder, EngineError, EngineHandle, EngineResult, OrchestrationEngine};
pub use events::{EventHandler, ExecutionEvent};
pub use interrupts::InterruptError;
