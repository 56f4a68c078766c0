//! # forkguard-core
//!
//! Fork-safety coordination for multi-threaded processes.
//!
//! After `fork()` only the calling thread survives in the child. Any lock held
//! by another thread at fork time stays held forever, because its owner does
//! not exist there. The standard output/error streams are the usual victims:
//! the child deadlocks on its first write.
//!
//! This crate holds the safe core of the coordinator:
//!
//! ```text
//! OS fork() -> pre-fork handler -> fork -> parent handler | child handler
//!                 |                           |               |
//!             inspect locks              run callbacks   fix up held locks,
//!             run callbacks                              then run callbacks
//! ```
//!
//! The `pthread_atfork` boundary, the C stdio host and the process-global
//! registration table live in `forkguard-abi`.

#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod diag;
pub mod error;
#[allow(unsafe_code)]
pub mod lock;
pub mod registry;
pub mod streams;
pub mod watch;

pub use config::{DiagnosticFormat, ForkGuardConfig};
pub use coordinator::ForkCoordinator;
pub use diag::{Diagnostic, DiagnosticSink, MemorySink, ResourceKind};
pub use error::{CallbackError, ForkGuardError, ProbeError, StreamUnavailable};
pub use lock::{ChildPhase, ForkHeldMutex, ForkLock, TryAcquire, force_release, probe_with};
pub use registry::{CallbackRegistry, ForkCallback, Phase, fork_callback, run_callbacks};
pub use streams::{LockGuarded, LockedStream, StdStreams, StreamPair};
pub use watch::WatchList;
