//! Core domain models for the orchestration engine
//!
//! This module defines the plan graph, the execution context and the durable
//! execution records the engine drives.

pub mod ambiance;
pub mod condition;
pub mod config;
pub mod execution;
pub mod failure;
pub mod interrupt;
pub mod plan;
pub mod status;

pub use ambiance::*;
pub use execution::*;
pub use failure::*;
pub use interrupt::*;
pub use plan::*;
pub use status::Status;
