//! The process-wide coordinator and its free-function API.

use std::sync::{Arc, OnceLock};

use forkguard_core::{
    CallbackError, ForkCallback, ForkCoordinator, ForkGuardConfig, ForkGuardError, LockGuarded,
};

use crate::fd_sink::RawFdSink;
use crate::hooks::register_coordinator;
use crate::stdio::CStdioStreams;

static GLOBAL: OnceLock<ForkCoordinator> = OnceLock::new();

/// The process coordinator: C stdio streams, diagnostics on fd 2, and the
/// `FORKGUARD_*` environment configuration.
pub fn global() -> &'static ForkCoordinator {
    GLOBAL.get_or_init(|| {
        ForkCoordinator::new(
            CStdioStreams::new(),
            RawFdSink::stderr(),
            ForkGuardConfig::from_env(),
        )
    })
}

/// Install and enable `coordinator`'s fork handlers. Idempotent.
pub fn install(coordinator: &'static ForkCoordinator) -> Result<(), ForkGuardError> {
    coordinator.install_with(|| register_coordinator(coordinator).map_err(|err| err.errno()))
}

/// Install and enable the process coordinator's fork handlers.
pub fn install_hooks() -> Result<(), ForkGuardError> {
    install(global())
}

/// Turn the process coordinator's handlers into no-ops.
pub fn disable_hooks() -> Result<(), ForkGuardError> {
    global().disable()
}

#[must_use]
pub fn hooks_enabled() -> bool {
    global().is_enabled()
}

pub fn on_pre_fork<F>(f: F) -> Result<ForkCallback, ForkGuardError>
where
    F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
{
    global().on_pre_fork(f)
}

pub fn on_post_fork_parent<F>(f: F) -> Result<ForkCallback, ForkGuardError>
where
    F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
{
    global().on_post_fork_parent(f)
}

pub fn on_post_fork_child<F>(f: F) -> Result<ForkCallback, ForkGuardError>
where
    F: Fn() -> Result<(), CallbackError> + Send + Sync + 'static,
{
    global().on_post_fork_child(f)
}

pub fn watch(resource: Arc<dyn LockGuarded>) -> Result<(), ForkGuardError> {
    global().watch(resource)
}

/// Last callback failure recorded by the process coordinator's handlers.
pub fn take_fork_error() -> Option<ForkGuardError> {
    global().take_fork_error()
}
