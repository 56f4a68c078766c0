//! Lock inspection primitive.
//!
//! The only module in this crate allowed to contain `unsafe`. Everything that
//! depends on how a particular lock stores its held/available state sits here
//! or behind a [`ForkLock`] implementation in `forkguard-abi`.
//!
//! Two inspection strategies are supported behind the same contract:
//! - probe-based: non-blocking try-acquire, released again on success
//!   ([`probe_with`]);
//! - direct-state: read the lock's state word without acquiring it (the
//!   parking_lot implementations below).

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, MutexGuard, RawMutex};

use crate::error::ProbeError;

/// A lock whose state the coordinator can inspect and, in the child, clear.
pub trait ForkLock: Send + Sync {
    /// Whether the lock is currently held.
    ///
    /// Must not block, and must leave a lock held by another thread exactly as
    /// it found it.
    fn is_held(&self) -> Result<bool, ProbeError>;

    /// Mark the lock available regardless of owner.
    ///
    /// # Safety
    ///
    /// Only valid in the sole thread of a freshly forked child, on a lock found
    /// held: the thread that owned it does not exist in this process.
    unsafe fn release_forced(&self);
}

/// Witness that the caller runs as the only thread of a forked child.
#[derive(Debug)]
pub struct ChildPhase {
    _private: (),
}

impl ChildPhase {
    /// # Safety
    ///
    /// The calling thread must be the only thread in the process, running the
    /// post-fork-child handler (or an equivalent single-threaded context where
    /// no thread can legitimately own any lock the coordinator inspects).
    #[must_use]
    pub unsafe fn assume() -> Self {
        Self { _private: () }
    }
}

/// Forcibly release `lock` inside a forked child.
pub fn force_release(lock: &dyn ForkLock, _child: &ChildPhase) {
    // SAFETY: `ChildPhase` can only be obtained by a caller asserting that no
    // other thread exists; the held lock's owner is gone.
    unsafe { lock.release_forced() }
}

/// Result of a single non-blocking acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquire {
    Acquired,
    Busy,
    /// errno of an unexpected failure.
    Failed(i32),
}

/// Probe-based `is_held`: try to acquire; on success release immediately and
/// report free, on contention report held.
pub fn probe_with(
    try_acquire: impl FnOnce() -> TryAcquire,
    release: impl FnOnce(),
) -> Result<bool, ProbeError> {
    match try_acquire() {
        TryAcquire::Acquired => {
            release();
            Ok(false)
        }
        TryAcquire::Busy => Ok(true),
        TryAcquire::Failed(errno) => Err(ProbeError::Platform { errno }),
    }
}

// Waiters a dead owner can leave parked on one parking_lot lock before the
// drain in `release_forced` gives up.
const MAX_PARKED: usize = 64;

impl<T: ?Sized + Send> ForkLock for Mutex<T> {
    fn is_held(&self) -> Result<bool, ProbeError> {
        Ok(self.is_locked())
    }

    unsafe fn release_forced(&self) {
        // SAFETY: forwarded from the trait contract; no guard for this lock
        // exists in the child.
        unsafe { self.raw().release_forced() }
    }
}

impl ForkLock for RawMutex {
    fn is_held(&self) -> Result<bool, ProbeError> {
        Ok(self.is_locked())
    }

    /// Unlocks until every parked waiter has been dequeued.
    ///
    /// Each slow unlock wakes one parked waiter, or under eventual fairness
    /// hands the lock straight to it. Those waiters did not survive the fork,
    /// so a single unlock can leave the lock held by a dead thread, and a
    /// queued waiter left behind would be handed the lock on the child's own
    /// next unlock.
    unsafe fn release_forced(&self) {
        for _ in 0..MAX_PARKED {
            if self.is_locked() {
                // SAFETY: forwarded from the trait contract.
                unsafe { self.unlock() };
            } else if self.try_lock() {
                // SAFETY: acquired just above on this thread.
                unsafe { self.unlock() };
            }
        }
    }
}

/// Mutex that fork handlers can keep held through `fork()`.
///
/// The pre-fork handler calls [`hold_for_fork`](Self::hold_for_fork) as its
/// last step; the parent and child handlers take the hold back with
/// [`resume_after_fork`](Self::resume_after_fork). Guarded data is therefore
/// never copied into a child mid-mutation.
#[derive(Debug)]
pub struct ForkHeldMutex<T> {
    inner: Mutex<T>,
    held_across_fork: AtomicBool,
}

impl<T> ForkHeldMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: parking_lot::const_mutex(value),
            held_across_fork: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Acquire and leave held until [`resume_after_fork`](Self::resume_after_fork).
    pub fn hold_for_fork(&self) {
        std::mem::forget(self.inner.lock());
        self.held_across_fork.store(true, Ordering::Release);
    }

    /// Take back the hold left by `hold_for_fork`; dropping the guard unlocks.
    ///
    /// Falls back to a normal `lock` when no hold is outstanding.
    pub fn resume_after_fork(&self) -> MutexGuard<'_, T> {
        if self.held_across_fork.swap(false, Ordering::AcqRel) {
            // SAFETY: the lock was acquired by `hold_for_fork` on this thread
            // (or on the parent thread this child thread is a copy of) and its
            // guard was leaked, so the lock is held on our behalf.
            unsafe { self.inner.make_guard_unchecked() }
        } else {
            self.inner.lock()
        }
    }

    #[must_use]
    pub fn is_held_for_fork(&self) -> bool {
        self.held_across_fork.load(Ordering::Acquire)
    }
}
