//! End-to-end fork scenarios for forkguard.
//!
//! This crate provides:
//! - Scenario runners that install the process coordinator, fork once and
//!   report how the child ended
//! - Report rendering as text or one JSON object per scenario

#![deny(unsafe_code)]

pub mod error;
#[allow(unsafe_code)]
pub mod process;
pub mod scenario;

pub use error::HarnessError;
pub use process::{ChildStatus, c_stdout_line, run_in_child};
pub use scenario::{Scenario, ScenarioOptions, ScenarioReport, run};
