// The C entry points take raw pointers from C callers and document their
// contracts on the functions that need one.
#![allow(clippy::missing_safety_doc)]
//! # forkguard-abi
//!
//! The `pthread_atfork` boundary for forkguard.
//!
//! ```text
//! fork() -> libc atfork list -> trampoline (this crate) -> ForkCoordinator (core)
//! ```
//!
//! This crate owns everything that touches the platform: the one-time
//! `pthread_atfork` registration and its coordinator table, the C stdio
//! standard-stream host, the probe-based pthread mutex lock, the raw
//! file-descriptor diagnostic sink, the process-global API and the
//! `forkguard_*` C symbols.

pub mod c_abi;
pub mod fd_sink;
pub mod global;
pub mod hooks;
pub mod pthread_mutex;
pub mod stdio;

pub use fd_sink::RawFdSink;
pub use global::{
    disable_hooks, global, hooks_enabled, install, install_hooks, on_post_fork_child,
    on_post_fork_parent, on_pre_fork, take_fork_error, watch,
};
pub use hooks::{MAX_COORDINATORS, register_coordinator, registered_count};
pub use pthread_mutex::{PthreadMutex, PthreadMutexGuard, RawPthreadMutex};
pub use stdio::{CFileGuard, CFileLock, CStdioStreams};
