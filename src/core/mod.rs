//! Core domain models for orchestration.
//!
//! Tasks and the plan DAG, agent results and patches, and the run-level
//! aggregate that ties a request to its outcome.

pub mod dag;
pub mod result;
pub mod run;
pub mod task;

pub use dag::TaskPlan;
pub use result::{AgentOutcome, AgentResult, Patch};
pub use run::{slugify, OrchestrationRun, Request, RunEvent, RunId, RunStatus, UserStory};
pub use task::{Task, TaskId, TaskKind, TaskStatus};
