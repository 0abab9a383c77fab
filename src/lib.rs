//! Autonomous pull request orchestration.
//!
//! A natural-language change request is planned into a DAG of tasks, each
//! task is carried out by an isolated agent context, and the resulting
//! patches are integrated into a single pull request on the target
//! repository.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod hosting;
pub mod inference;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RequestOptions};
