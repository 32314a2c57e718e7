//! orchestrator - a resumable engine for compiled execution plans

pub mod advise;
pub mod cli;
pub mod consumer;
pub mod core;
pub mod dispatch;
pub mod execution;
pub mod persistence;
pub mod strategy;
pub mod timeout;

// Re-export commonly used types
pub use advise::{Adviser, AdviserRegistry, AdviserResponse};
pub use core::{config::EngineConfig, Interrupt, InterruptType, NodeExecution, Plan, PlanExecution, Status};
pub use dispatch::{local::LocalTaskExecutor, TaskExecutor, TaskResponse};
pub use execution::{EngineError, ExecutionEvent, OrchestrationEngine};
pub use persistence::{ExecutionStore, InMemoryStore};
pub use strategy::{Executable, StepRegistry};
