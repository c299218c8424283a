//! # Code Execution Pipeline
//!
//! Accepts code submissions, runs them on interchangeable execution backends
//! and hands the result back either through a TTL result store (pull) or a
//! live connection (push).
//!
//! A submission flows through:
//!
//! 1. [`IngestionGateway`]: validation and sliding-window admission, then a
//!    publish to the intake queue
//! 2. [`ExecutionService`]: a bounded worker pool consuming the intake queue
//! 3. [`Orchestrator`]: dispatch, wait against a deadline, collect, cleanup on
//!    the [`backend::ExecutionBackend`] selected for the language
//! 4. [`store::ResultStore`] write plus a [`ResultMessage`] on the result queue
//! 5. [`Notifier`]: pushes that message to the connection registered under
//!    its correlation id, if any

pub mod backend;
mod error;
mod gateway;
mod notifier;
mod orchestrator;
pub mod queue;
mod rate_limit;
mod registry;
mod service;
pub mod store;
mod toolchain;
mod types;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use gateway::{IngestionGateway, SubmitAck};
pub use notifier::{DeliveryOutcome, Notifier};
pub use orchestrator::{ExecutionJob, JobReport, JobState, Orchestrator, OrchestratorConfig};
pub use rate_limit::SlidingWindowLimiter;
pub use registry::{Connection, ConnectionRegistry, PushChannel};
pub use service::{ExecutionService, WorkerConfig};
pub use toolchain::{Step, Toolchain};
pub use types::{Language, ResourceLimits, ResultMessage, SubmissionMessage};

/// Result type for code execution operations
pub type Result<T> = std::result::Result<T, Error>;
