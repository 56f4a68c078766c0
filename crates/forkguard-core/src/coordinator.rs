//! The fork coordinator: handler triplet and installation state machine.
//!
//! Across one `fork()` the coordinator moves
//! `idle -> pre_fork_running -> {parent_branch | child_branch} -> idle`.
//!
//! Locks are inspected in a fixed order: standard output, standard error,
//! then the watch list in insertion order. In the child every held lock is
//! released before any user callback runs, since a callback may write to the
//! very stream that was left locked.

use std::fmt;
use std::sync::Arc;

use crate::config::ForkGuardConfig;
use crate::diag::{Diagnostic, DiagnosticSink, ResourceKind};
use crate::error::{CallbackError, ForkGuardError, ProbeError};
use crate::lock::{ChildPhase, ForkHeldMutex, ForkLock, force_release};
use crate::registry::{CallbackRegistry, ForkCallback, Phase, run_callbacks};
use crate::streams::{LockGuarded, StdStreams};
use crate::watch::WatchList;

/// Shared mutable state, guarded by the coordinator's fork-held lock.
#[derive(Debug, Default)]
struct CoordinatorState {
    callbacks: CallbackRegistry,
    watched: WatchList,
    /// Handlers registered with the OS. Never reset once set.
    installed: bool,
    /// Handlers active. Implies `installed`.
    enabled: bool,
    last_error: Option<ForkGuardError>,
}

/// Process-wide fork-safety coordinator.
///
/// One instance is normally installed for the whole process (see
/// `forkguard-abi`), but instances are plain values: tests build their own
/// with in-memory streams and sinks and drive the handlers directly.
pub struct ForkCoordinator {
    state: ForkHeldMutex<CoordinatorState>,
    streams: Box<dyn StdStreams>,
    sink: Box<dyn DiagnosticSink>,
    config: ForkGuardConfig,
}

impl fmt::Debug for ForkCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkCoordinator")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ForkCoordinator {
    pub fn new(
        streams: impl StdStreams + 'static,
        sink: impl DiagnosticSink + 'static,
        config: ForkGuardConfig,
    ) -> Self {
        Self {
            state: ForkHeldMutex::new(CoordinatorState::default()),
            streams: Box::new(streams),
            sink: Box::new(sink),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> ForkGuardConfig {
        self.config
    }

    // -----------------------------------------------------------------------
    // Installation state machine
    // -----------------------------------------------------------------------

    /// Install the handlers (once) and enable them.
    ///
    /// `register` performs the OS registration and returns an errno on
    /// failure. It is only called the first time; later calls just re-enable.
    pub fn install_with(
        &self,
        register: impl FnOnce() -> Result<(), i32>,
    ) -> Result<(), ForkGuardError> {
        let mut state = self.state.lock();
        if !state.installed {
            register().map_err(|errno| ForkGuardError::Registration { errno })?;
            state.installed = true;
        }
        state.enabled = true;
        Ok(())
    }

    /// Turn the installed handlers into no-ops.
    pub fn disable(&self) -> Result<(), ForkGuardError> {
        let mut state = self.state.lock();
        if !state.installed {
            return Err(ForkGuardError::NotInstalled);
        }
        state.enabled = false;
        Ok(())
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.state.lock().installed
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Append `callback` to `phase`'s list and hand it back for reuse.
    pub fn register(
        &self,
        phase: Phase,
        callback: ForkCallback,
    ) -> Result<ForkCallback, ForkGuardError> {
        self.state
            .lock()
            .callbacks
            .register(phase, Arc::clone(&callback))?;
        Ok(callback)
    }

    pub fn on_pre_fork<F>(&self, f: F) -> Result<ForkCallback, ForkGuardError>
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.register(Phase::PreFork, Arc::new(f))
    }

    pub fn on_post_fork_parent<F>(&self, f: F) -> Result<ForkCallback, ForkGuardError>
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.register(Phase::PostForkParent, Arc::new(f))
    }

    pub fn on_post_fork_child<F>(&self, f: F) -> Result<ForkCallback, ForkGuardError>
    where
        F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.register(Phase::PostForkChild, Arc::new(f))
    }

    /// Add a lock-guarded resource to the watch list.
    pub fn watch(&self, resource: Arc<dyn LockGuarded>) -> Result<(), ForkGuardError> {
        self.state.lock().watched.watch(resource).map(|_| ())
    }

    #[must_use]
    pub fn callback_count(&self, phase: Phase) -> usize {
        self.state.lock().callbacks.len(phase)
    }

    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.state.lock().watched.len()
    }

    /// Last callback failure recorded by a fork handler, if any.
    ///
    /// Handlers invoked by the OS have no caller to return an error to; the
    /// code that called `fork()` picks it up here.
    pub fn take_fork_error(&self) -> Option<ForkGuardError> {
        self.state.lock().last_error.take()
    }

    /// Drop every callback and watched resource. The installed flag stays.
    pub fn teardown(&self) {
        let mut state = self.state.lock();
        state.callbacks.clear();
        state.watched.clear();
        state.last_error = None;
    }

    // -----------------------------------------------------------------------
    // Handler triplet
    // -----------------------------------------------------------------------

    /// Pre-fork handler: advisories for held locks, then pre-fork callbacks.
    ///
    /// Always returns with the state lock held for the fork; the parent or
    /// child handler releases it.
    pub fn pre_fork(&self) -> Result<(), CallbackError> {
        let callbacks = {
            let state = self.state.lock();
            if state.enabled && self.sweep(&state, Phase::PreFork, None).is_ok() {
                Some(state.callbacks.snapshot(Phase::PreFork))
            } else {
                None
            }
        };
        let result = match callbacks {
            Some(callbacks) => self.run_phase(Phase::PreFork, &callbacks),
            None => Ok(()),
        };
        self.state.hold_for_fork();
        result
    }

    /// Post-fork handler in the parent. Locks are left alone: every thread
    /// that holds one still exists.
    pub fn post_fork_parent(&self) -> Result<(), CallbackError> {
        let callbacks = {
            let state = self.state.resume_after_fork();
            if !state.enabled {
                return Ok(());
            }
            state.callbacks.snapshot(Phase::PostForkParent)
        };
        self.run_phase(Phase::PostForkParent, &callbacks)
    }

    /// Post-fork handler in the child: release held locks, then callbacks.
    pub fn post_fork_child(&self, child: &ChildPhase) -> Result<(), CallbackError> {
        let callbacks = {
            let state = self.state.resume_after_fork();
            if !state.enabled {
                return Ok(());
            }
            if self.sweep(&state, Phase::PostForkChild, Some(child)).is_err() {
                return Ok(());
            }
            state.callbacks.snapshot(Phase::PostForkChild)
        };
        self.run_phase(Phase::PostForkChild, &callbacks)
    }

    fn run_phase(&self, phase: Phase, callbacks: &[ForkCallback]) -> Result<(), CallbackError> {
        let result = run_callbacks(phase, callbacks, self.sink.as_ref(), self.config.format);
        if let Err(err) = &result {
            if !err.is_exit() {
                self.state.lock().last_error = Some(ForkGuardError::Callback {
                    phase,
                    source: err.clone(),
                });
            }
        }
        result
    }

    fn emit(&self, diagnostic: Diagnostic) {
        self.sink.emit(&diagnostic, self.config.format);
    }

    /// Visit every lock in fixed order. Stops at the first probe failure.
    fn sweep(
        &self,
        state: &CoordinatorState,
        phase: Phase,
        child: Option<&ChildPhase>,
    ) -> Result<(), ProbeError> {
        let streams = [
            (ResourceKind::StandardOutput, self.streams.stdout_lock()),
            (ResourceKind::StandardError, self.streams.stderr_lock()),
        ];
        for (resource, lock) in streams {
            match lock {
                Ok(lock) => self.visit(resource, lock, phase, child)?,
                Err(why) => self.emit(Diagnostic::LockUnavailable {
                    resource,
                    reason: why.to_string(),
                }),
            }
        }

        for watched in state.watched.iter() {
            match watched.fork_lock() {
                Some(lock) => self.visit(ResourceKind::Watched, lock, phase, child)?,
                None => self.emit(Diagnostic::LockUnavailable {
                    resource: ResourceKind::Watched,
                    reason: "resource no longer exposes a lock".to_string(),
                }),
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        resource: ResourceKind,
        lock: &dyn ForkLock,
        phase: Phase,
        child: Option<&ChildPhase>,
    ) -> Result<(), ProbeError> {
        let held = lock.is_held().inspect_err(|err| {
            let ProbeError::Platform { errno } = *err;
            self.emit(Diagnostic::ProbeFailed {
                phase,
                resource,
                errno,
            });
        })?;
        if !held {
            return Ok(());
        }
        match child {
            Some(child) => {
                self.emit(Diagnostic::DeadlockReleased { resource });
                force_release(lock, child);
            }
            None if self.config.advisory => self.emit(Diagnostic::PossibleDeadlock { resource }),
            None => {}
        }
        Ok(())
    }
}
