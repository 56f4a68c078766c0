//! Probe-based `ForkLock` over POSIX mutexes.
//!
//! A `pthread_mutex_t` exposes no portable "is locked" query, so inspection
//! goes through `pthread_mutex_trylock`: success means free (and the probe
//! hold is dropped again at once), `EBUSY` means held.

use std::cell::UnsafeCell;
use std::ffi::c_int;
use std::fmt;
use std::marker::PhantomData;

use forkguard_core::{ForkLock, LockGuarded, ProbeError, TryAcquire, probe_with};

fn probe(mutex: *mut libc::pthread_mutex_t) -> Result<bool, ProbeError> {
    probe_with(
        || {
            // SAFETY: caller guarantees `mutex` points at an initialised mutex.
            match unsafe { libc::pthread_mutex_trylock(mutex) } {
                0 => TryAcquire::Acquired,
                libc::EBUSY => TryAcquire::Busy,
                errno => TryAcquire::Failed(errno),
            }
        },
        || {
            // SAFETY: the trylock above succeeded on this thread.
            unsafe { libc::pthread_mutex_unlock(mutex) };
        },
    )
}

unsafe fn reinitialise(mutex: *mut libc::pthread_mutex_t) {
    // SAFETY: caller guarantees exclusive access (sole thread of a child) and
    // a valid pointer. Overwriting with the static initialiser is the only
    // reset that does not depend on the dead owner.
    unsafe { mutex.write(libc::PTHREAD_MUTEX_INITIALIZER) };
}

/// An owned default-attribute `pthread_mutex_t`.
///
/// The mutex must not be moved once it has been locked; keep it in an `Arc`
/// or a `static` before first use.
pub struct PthreadMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the mutex is designed to be shared between threads; all access to
// the inner storage goes through pthread calls.
unsafe impl Send for PthreadMutex {}
// SAFETY: see above.
unsafe impl Sync for PthreadMutex {}

impl fmt::Debug for PthreadMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PthreadMutex")
            .field("ptr", &self.raw.get())
            .finish()
    }
}

impl Default for PthreadMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl PthreadMutex {
    pub const fn new() -> Self {
        Self {
            raw: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
        }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }

    /// Block until acquired. Returns the pthread error code on failure.
    pub fn lock(&self) -> Result<PthreadMutexGuard<'_>, c_int> {
        // SAFETY: `raw` is an initialised mutex owned by `self`.
        match unsafe { libc::pthread_mutex_lock(self.as_ptr()) } {
            0 => Ok(PthreadMutexGuard::new(self)),
            errno => Err(errno),
        }
    }

    /// `Ok(None)` when another owner holds the mutex.
    pub fn try_lock(&self) -> Result<Option<PthreadMutexGuard<'_>>, c_int> {
        // SAFETY: `raw` is an initialised mutex owned by `self`.
        match unsafe { libc::pthread_mutex_trylock(self.as_ptr()) } {
            0 => Ok(Some(PthreadMutexGuard::new(self))),
            libc::EBUSY => Ok(None),
            errno => Err(errno),
        }
    }
}

impl Drop for PthreadMutex {
    fn drop(&mut self) {
        // SAFETY: no guard can outlive `self`, so the mutex is unlocked here
        // unless a guard was leaked; destroy then reports EBUSY, ignored.
        unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
    }
}

impl ForkLock for PthreadMutex {
    fn is_held(&self) -> Result<bool, ProbeError> {
        probe(self.as_ptr())
    }

    unsafe fn release_forced(&self) {
        // SAFETY: forwarded from the trait contract.
        unsafe { reinitialise(self.as_ptr()) }
    }
}

impl LockGuarded for PthreadMutex {
    fn fork_lock(&self) -> Option<&dyn ForkLock> {
        Some(self)
    }
}

/// RAII guard for [`PthreadMutex`].
#[must_use = "the mutex is unlocked when the guard is dropped"]
pub struct PthreadMutexGuard<'a> {
    mutex: &'a PthreadMutex,
    // pthread mutexes must be unlocked by the owning thread.
    _not_send: PhantomData<*const ()>,
}

impl<'a> PthreadMutexGuard<'a> {
    fn new(mutex: &'a PthreadMutex) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for PthreadMutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PthreadMutexGuard").field(self.mutex).finish()
    }
}

impl Drop for PthreadMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread owns the mutex.
        unsafe { libc::pthread_mutex_unlock(self.mutex.as_ptr()) };
    }
}

/// A mutex owned by foreign code, watched by address.
#[derive(Debug)]
pub struct RawPthreadMutex {
    ptr: *mut libc::pthread_mutex_t,
}

// SAFETY: only the address is shared; every access is a pthread call on it.
unsafe impl Send for RawPthreadMutex {}
// SAFETY: see above.
unsafe impl Sync for RawPthreadMutex {}

impl RawPthreadMutex {
    /// Wrap a foreign mutex. Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at an initialised `pthread_mutex_t` that stays valid,
    /// and is not moved, for as long as the returned value exists.
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut libc::pthread_mutex_t) -> Option<Self> {
        (!ptr.is_null()).then_some(Self { ptr })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.ptr
    }
}

impl ForkLock for RawPthreadMutex {
    fn is_held(&self) -> Result<bool, ProbeError> {
        probe(self.ptr)
    }

    unsafe fn release_forced(&self) {
        // SAFETY: forwarded from the trait contract.
        unsafe { reinitialise(self.ptr) }
    }
}

impl LockGuarded for RawPthreadMutex {
    fn fork_lock(&self) -> Option<&dyn ForkLock> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, mpsc};
    use std::thread;

    use forkguard_core::{ChildPhase, force_release};

    use super::*;

    #[test]
    fn probe_sees_own_and_foreign_state() {
        let mutex = Arc::new(PthreadMutex::new());
        assert!(!mutex.is_held().unwrap());

        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let _guard = mutex.lock().unwrap();
                locked_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        locked_rx.recv().unwrap();
        assert!(mutex.is_held().unwrap());
        assert!(mutex.try_lock().unwrap().is_none());
        done_tx.send(()).unwrap();
        holder.join().unwrap();

        assert!(!mutex.is_held().unwrap());
        assert!(mutex.try_lock().unwrap().is_some());
    }

    #[test]
    fn forced_release_reinitialises() {
        let mutex = PthreadMutex::new();
        std::mem::forget(mutex.lock().unwrap());
        // SAFETY: single-threaded test; the owner guard was leaked.
        let child = unsafe { ChildPhase::assume() };
        force_release(&mutex, &child);
        assert!(mutex.try_lock().unwrap().is_some());
    }

    #[test]
    fn raw_wrapper_rejects_null() {
        // SAFETY: null is handled by `from_raw` itself.
        assert!(unsafe { RawPthreadMutex::from_raw(std::ptr::null_mut()) }.is_none());
    }

    #[test]
    fn raw_wrapper_probes_the_same_mutex() {
        let mutex = PthreadMutex::new();
        // SAFETY: `mutex` outlives `raw` and is not moved in between.
        let raw = unsafe { RawPthreadMutex::from_raw(mutex.as_ptr()) }.unwrap();
        assert!(!raw.is_held().unwrap());
        let guard = mutex.lock().unwrap();
        // Default mutexes are not recursive, so the owning thread sees EBUSY.
        assert!(raw.is_held().unwrap());
        drop(guard);
        assert!(!raw.is_held().unwrap());
    }
}
