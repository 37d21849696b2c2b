//! Durable workflow execution.
//!
//! A workflow is an async function that issues *steps* through a
//! [`WorkflowContext`]. Each step runs on a worker slot under its own
//! timeouts and retry policy, and its result is appended to a [`StepLog`].
//!
//! ```text
//! Engine::run(id) ──▶ in flight? ──yes──▶ wait for shared result
//!                        │ no
//!                        ▼
//!                  load history ──completed──▶ reuse output
//!                        │ open
//!                        ▼
//!                  replay recorded steps, execute the rest
//! ```
//!
//! Identities are deterministic strings built from the request, so equal
//! requests share one run, and a process restart resumes interrupted runs
//! from the log instead of repeating finished steps.

mod context;
mod executor;
mod history;
mod options;
mod saga;
mod worker;

pub use context::{StepContext, WorkflowContext};
pub use executor::{Engine, DEFAULT_RESULT_CACHE_CAPACITY};
pub use history::{FileStepLog, HistoryEvent, InMemoryStepLog, LatestRun, StepLog};
pub use options::{ReusePolicy, RetryPolicy, RunOptions, StepOptions};
pub use saga::Saga;
pub use worker::Workers;
