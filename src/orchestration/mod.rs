//! Orchestration layer.
//!
//! The pipeline behind `Orchestrator::handle_request`: the planner turns a
//! request into a task DAG, the supervisor runs agent contexts over it, and
//! the integrator publishes the surviving patches as one pull request. The
//! Claude headless executor backs both inference and agent contexts.

mod claude;
mod integrator;
mod orchestrator;
mod planner;
mod supervisor;

pub use claude::{ClaudeHeadless, ClaudeOutcome, ClaudeRun, DEFAULT_TIMEOUT_SECS};
pub use integrator::{
    branch_name, fingerprint_marker, parse_commit_fingerprint, parse_fingerprint, IntegrationUnit,
    Integrator,
};
pub use orchestrator::{Orchestrator, RequestOptions};
pub use planner::{parse_plan, PlannedWork, Planner};
pub use supervisor::{build_instructions, ExecutionReport, Supervisor, SupervisorConfig, CANCELLED_REASON};
