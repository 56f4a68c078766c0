//! Harness error type.

use forkguard_core::ForkGuardError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("fork failed: {}", os_error_text(.0))]
    Fork(i32),
    #[error("waitpid failed: {}", os_error_text(.0))]
    Wait(i32),
    #[error("C stdout is not available")]
    NoStdout,
    #[error("line contains an interior NUL byte")]
    InteriorNul,
    #[error("coordinator setup failed: {0}")]
    Setup(#[from] ForkGuardError),
    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),
}

fn os_error_text(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}
