//! Diagnostics written to the process error channel.
//!
//! Every affected resource produces exactly one line per phase. Resources are
//! named generically: `standard-output`, `standard-error`, or
//! `a watched resource`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::DiagnosticFormat;
use crate::registry::Phase;

/// Which lock a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    #[serde(rename = "standard-output")]
    StandardOutput,
    #[serde(rename = "standard-error")]
    StandardError,
    #[serde(rename = "watched")]
    Watched,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StandardOutput => "standard-output",
            Self::StandardError => "standard-error",
            Self::Watched => "a watched resource",
        })
    }
}

/// A single diagnostic event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Pre-fork advisory: the lock is held while the process forks.
    PossibleDeadlock { resource: ResourceKind },
    /// Child fixup: the lock was found held and has been released.
    DeadlockReleased { resource: ResourceKind },
    /// The lock could not be retrieved; fixup continues with the others.
    LockUnavailable {
        resource: ResourceKind,
        reason: String,
    },
    /// The non-blocking probe failed; the handler stopped early.
    ProbeFailed {
        phase: Phase,
        resource: ResourceKind,
        errno: i32,
    },
    /// A registered callback failed; the run continued.
    CallbackFailed { phase: Phase, error: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PossibleDeadlock { resource } => write!(f, "possible deadlock for {resource}"),
            Self::DeadlockReleased { resource } => {
                write!(f, "deadlock for {resource}, releasing")
            }
            Self::LockUnavailable { resource, reason } => {
                write!(f, "unable to obtain {resource} lock: {reason}")
            }
            Self::ProbeFailed {
                phase,
                resource,
                errno,
            } => write!(
                f,
                "{phase}: lock probe failed for {resource}: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Self::CallbackFailed { phase, error } => {
                write!(f, "error in {phase} handler: {error}")
            }
        }
    }
}

impl Diagnostic {
    /// Render as one newline-terminated line.
    #[must_use]
    pub fn render(&self, format: DiagnosticFormat) -> String {
        let mut line = match format {
            DiagnosticFormat::Text => self.to_string(),
            DiagnosticFormat::Json => {
                serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
            }
        };
        line.push('\n');
        line
    }
}

/// Destination for diagnostics.
///
/// Implementations used inside the post-fork-child handler must not go
/// through any lock-guarded stream: that path may be the deadlocked one.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic, format: DiagnosticFormat);
}

impl<T: DiagnosticSink + ?Sized> DiagnosticSink for Arc<T> {
    fn emit(&self, diagnostic: &Diagnostic, format: DiagnosticFormat) {
        (**self).emit(diagnostic, format);
    }
}

/// In-memory sink for tests and tooling.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    /// Rendered lines, in emission order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        self.lines.lock().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: &Diagnostic, format: DiagnosticFormat) {
        self.lines.lock().push(diagnostic.render(format));
        self.events.lock().push(diagnostic.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_lines_name_resources_generically() {
        let held = Diagnostic::PossibleDeadlock {
            resource: ResourceKind::StandardOutput,
        };
        assert_eq!(
            held.render(DiagnosticFormat::Text),
            "possible deadlock for standard-output\n"
        );

        let released = Diagnostic::DeadlockReleased {
            resource: ResourceKind::Watched,
        };
        assert_eq!(
            released.render(DiagnosticFormat::Text),
            "deadlock for a watched resource, releasing\n"
        );
    }

    #[test]
    fn json_lines_carry_event_tag() {
        let diag = Diagnostic::DeadlockReleased {
            resource: ResourceKind::StandardError,
        };
        let line = diag.render(DiagnosticFormat::Json);
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["event"], "deadlock_released");
        assert_eq!(value["resource"], "standard-error");
    }

    #[test]
    fn callback_failure_line_includes_phase() {
        let diag = Diagnostic::CallbackFailed {
            phase: Phase::PreFork,
            error: "boom".into(),
        };
        assert_eq!(diag.to_string(), "error in pre-fork handler: boom");
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.emit(
            &Diagnostic::PossibleDeadlock {
                resource: ResourceKind::StandardOutput,
            },
            DiagnosticFormat::Text,
        );
        sink.emit(
            &Diagnostic::PossibleDeadlock {
                resource: ResourceKind::StandardError,
            },
            DiagnosticFormat::Text,
        );
        assert_eq!(
            sink.lines(),
            vec![
                "possible deadlock for standard-output\n".to_string(),
                "possible deadlock for standard-error\n".to_string(),
            ]
        );
        sink.clear();
        assert!(sink.is_empty());
    }
}
