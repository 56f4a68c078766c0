//! Callback registry: one insertion-ordered list per fork phase.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::config::DiagnosticFormat;
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::error::{CallbackError, ForkGuardError};

/// Zero-argument fork callback.
pub type ForkCallback = Arc<dyn Fn() -> Result<(), CallbackError> + Send + Sync>;

/// Wrap a closure as a [`ForkCallback`].
pub fn fork_callback<F>(f: F) -> ForkCallback
where
    F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fork lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// In the parent, before the process is duplicated.
    PreFork,
    /// In the parent, after `fork()` returned.
    PostForkParent,
    /// In the only thread of the child.
    PostForkChild,
}

impl Phase {
    pub const ALL: [Self; 3] = [Self::PreFork, Self::PostForkParent, Self::PostForkChild];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreFork => "pre-fork",
            Self::PostForkParent => "post-fork-parent",
            Self::PostForkChild => "post-fork-child",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three callback lists.
///
/// Append-only; the only removal is [`clear`](Self::clear) at teardown.
/// Duplicates are allowed and run once per registration.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    pre_fork: Vec<ForkCallback>,
    post_fork_parent: Vec<ForkCallback>,
    post_fork_child: Vec<ForkCallback>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("pre_fork", &self.pre_fork.len())
            .field("post_fork_parent", &self.post_fork_parent.len())
            .field("post_fork_child", &self.post_fork_child.len())
            .finish()
    }
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, phase: Phase) -> &Vec<ForkCallback> {
        match phase {
            Phase::PreFork => &self.pre_fork,
            Phase::PostForkParent => &self.post_fork_parent,
            Phase::PostForkChild => &self.post_fork_child,
        }
    }

    fn list_mut(&mut self, phase: Phase) -> &mut Vec<ForkCallback> {
        match phase {
            Phase::PreFork => &mut self.pre_fork,
            Phase::PostForkParent => &mut self.post_fork_parent,
            Phase::PostForkChild => &mut self.post_fork_child,
        }
    }

    /// Append `callback` to the list for `phase`.
    ///
    /// Space is reserved before the push, so an allocation failure leaves the
    /// list unchanged.
    pub fn register(&mut self, phase: Phase, callback: ForkCallback) -> Result<(), ForkGuardError> {
        let list = self.list_mut(phase);
        list.try_reserve(1)
            .map_err(|_| ForkGuardError::OutOfMemory {
                what: "fork callback",
            })?;
        list.push(callback);
        Ok(())
    }

    #[must_use]
    pub fn len(&self, phase: Phase) -> usize {
        self.list(phase).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Phase::ALL.iter().all(|phase| self.list(*phase).is_empty())
    }

    /// Copy of one list, so it can be run without holding the registry.
    #[must_use]
    pub fn snapshot(&self, phase: Phase) -> Vec<ForkCallback> {
        self.list(phase).clone()
    }

    /// Run every callback registered for `phase`.
    pub fn run(
        &self,
        phase: Phase,
        sink: &dyn DiagnosticSink,
        format: DiagnosticFormat,
    ) -> Result<(), CallbackError> {
        run_callbacks(phase, self.list(phase), sink, format)
    }

    /// Drop all callbacks in all three lists.
    pub fn clear(&mut self) {
        self.pre_fork.clear();
        self.post_fork_parent.clear();
        self.post_fork_child.clear();
    }
}

/// Invoke `callbacks` in order, continuing past failures.
///
/// Each failure is reported to `sink`; the last one is returned once every
/// callback has run. A termination request (`CallbackError::Exit`) is returned
/// immediately and is not reported.
pub fn run_callbacks(
    phase: Phase,
    callbacks: &[ForkCallback],
    sink: &dyn DiagnosticSink,
    format: DiagnosticFormat,
) -> Result<(), CallbackError> {
    let mut last = None;
    for callback in callbacks {
        match invoke(callback) {
            Ok(()) => {}
            Err(err @ CallbackError::Exit(_)) => return Err(err),
            Err(err) => {
                sink.emit(
                    &Diagnostic::CallbackFailed {
                        phase,
                        error: err.to_string(),
                    },
                    format,
                );
                last = Some(err);
            }
        }
    }
    last.map_or(Ok(()), Err)
}

fn invoke(callback: &ForkCallback) -> Result<(), CallbackError> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
