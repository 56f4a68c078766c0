//! Error taxonomy for the fork coordinator.

use thiserror::Error;

use crate::diag::ResourceKind;
use crate::registry::Phase;

/// Failures surfaced synchronously to callers of the coordinator API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForkGuardError {
    /// `disable` was called before the hooks were ever installed.
    #[error("hooks are not registered yet")]
    NotInstalled,
    /// The platform refused the `pthread_atfork` registration.
    #[error("unable to register atfork hooks: {}", os_error_text(.errno))]
    Registration { errno: i32 },
    /// A resource handed to `watch` does not expose a lock.
    #[error("resource cannot be watched: {reason}")]
    InvalidResource { reason: &'static str },
    /// Growing one of the coordinator lists failed.
    #[error("out of memory while registering {what}")]
    OutOfMemory { what: &'static str },
    /// A callback failed while the OS ran a fork handler.
    #[error("error in {phase} handler: {source}")]
    Callback {
        phase: Phase,
        #[source]
        source: CallbackError,
    },
}

impl ForkGuardError {
    /// errno-style code for the C boundary.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotInstalled => EPERM,
            Self::Registration { errno } => *errno,
            Self::InvalidResource { .. } => EINVAL,
            Self::OutOfMemory { .. } => ENOMEM,
            Self::Callback { .. } => ECANCELED,
        }
    }
}

// Linux values; the core crate does not link libc.
const EPERM: i32 = 1;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;
const ECANCELED: i32 = 125;

fn os_error_text(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}

/// Outcome of a single failed callback invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    /// The callback returned an error.
    #[error("{0}")]
    Failed(String),
    /// The callback panicked; the payload message is kept.
    #[error("panicked: {0}")]
    Panicked(String),
    /// The callback asked for the process to terminate.
    #[error("exit requested with status {0}")]
    Exit(i32),
}

impl CallbackError {
    /// Convenience constructor for callback bodies.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(self, Self::Exit(_))
    }
}

/// The non-blocking lock probe itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("lock probe failed: {}", os_error_text(.errno))]
    Platform { errno: i32 },
}

/// A standard stream's lock could not be retrieved from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamUnavailable {
    #[error("unable to obtain {0}")]
    Missing(ResourceKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_c_boundary() {
        assert_eq!(ForkGuardError::NotInstalled.errno(), EPERM);
        assert_eq!(ForkGuardError::Registration { errno: 11 }.errno(), 11);
        assert_eq!(
            ForkGuardError::InvalidResource { reason: "x" }.errno(),
            EINVAL
        );
        assert_eq!(ForkGuardError::OutOfMemory { what: "x" }.errno(), ENOMEM);
    }

    #[test]
    fn callback_error_display_names_the_phase() {
        let err = ForkGuardError::Callback {
            phase: Phase::PostForkChild,
            source: CallbackError::failed("boom"),
        };
        assert_eq!(err.to_string(), "error in post-fork-child handler: boom");
    }

    #[test]
    fn stream_unavailable_names_the_stream() {
        let err = StreamUnavailable::Missing(ResourceKind::StandardOutput);
        assert_eq!(err.to_string(), "unable to obtain standard-output");
    }
}
