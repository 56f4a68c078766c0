//! Accessor contract between the coordinator and the host's streams.
//!
//! The coordinator never owns a stream or a resource. It only asks for the
//! lock embedded in it, at watch time (to validate) and at fork time (to
//! inspect or fix up).

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RawMutex};

use crate::diag::ResourceKind;
use crate::error::StreamUnavailable;
use crate::lock::ForkLock;

/// A resource whose consistency is protected by a lock.
pub trait LockGuarded: Send + Sync {
    /// The lock embedded in the resource, or `None` if it has none.
    fn fork_lock(&self) -> Option<&dyn ForkLock>;
}

/// Host access to the standard output/error locks.
pub trait StdStreams: Send + Sync {
    fn stdout_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable>;
    fn stderr_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable>;
}

impl<T: StdStreams + ?Sized> StdStreams for Arc<T> {
    fn stdout_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable> {
        (**self).stdout_lock()
    }

    fn stderr_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable> {
        (**self).stderr_lock()
    }
}

impl<T: Send> LockGuarded for Mutex<T> {
    fn fork_lock(&self) -> Option<&dyn ForkLock> {
        Some(self)
    }
}

impl LockGuarded for RawMutex {
    fn fork_lock(&self) -> Option<&dyn ForkLock> {
        Some(self)
    }
}

/// Lock-guarded text stream: a writer behind a parking_lot mutex.
///
/// Writes through `&LockedStream` take the lock for the duration of each call,
/// the way a buffered standard stream does.
#[derive(Debug, Default)]
pub struct LockedStream<W> {
    inner: Mutex<W>,
}

impl<W> LockedStream<W> {
    pub const fn new(writer: W) -> Self {
        Self {
            inner: parking_lot::const_mutex(writer),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, W> {
        self.inner.lock()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: Write> Write for &LockedStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<W: Send> LockGuarded for LockedStream<W> {
    fn fork_lock(&self) -> Option<&dyn ForkLock> {
        Some(&self.inner)
    }
}

/// A pair of [`LockedStream`]s standing in for standard output and error.
///
/// Either side may be absent, which the coordinator treats as
/// "lock unavailable".
#[derive(Debug, Default)]
pub struct StreamPair<O, E> {
    stdout: Option<LockedStream<O>>,
    stderr: Option<LockedStream<E>>,
}

impl<O, E> StreamPair<O, E> {
    pub const fn new(stdout: O, stderr: E) -> Self {
        Self {
            stdout: Some(LockedStream::new(stdout)),
            stderr: Some(LockedStream::new(stderr)),
        }
    }

    pub const fn from_parts(stdout: Option<LockedStream<O>>, stderr: Option<LockedStream<E>>) -> Self {
        Self { stdout, stderr }
    }

    pub fn stdout(&self) -> Option<&LockedStream<O>> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&LockedStream<E>> {
        self.stderr.as_ref()
    }
}

impl<O: Send, E: Send> StdStreams for StreamPair<O, E> {
    fn stdout_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable> {
        self.stdout
            .as_ref()
            .and_then(LockGuarded::fork_lock)
            .ok_or(StreamUnavailable::Missing(ResourceKind::StandardOutput))
    }

    fn stderr_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable> {
        self.stderr
            .as_ref()
            .and_then(LockGuarded::fork_lock)
            .ok_or(StreamUnavailable::Missing(ResourceKind::StandardError))
    }
}
