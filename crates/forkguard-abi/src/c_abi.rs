//! C ABI for non-Rust hosts.
//!
//! Every entry point returns `0` on success or a positive errno value, in the
//! style of the pthread functions.

use std::ffi::c_int;
use std::sync::Arc;

use forkguard_core::ForkGuardError;

use crate::global;
use crate::pthread_mutex::RawPthreadMutex;

/// A C fork callback. It cannot report failure.
pub type ForkHook = extern "C" fn();

fn status(result: Result<(), ForkGuardError>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}

fn register_hook(
    hook: Option<ForkHook>,
    register: fn(ForkHook) -> Result<(), ForkGuardError>,
) -> c_int {
    match hook {
        Some(hook) => status(register(hook)),
        None => libc::EINVAL,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn forkguard_install_hooks() -> c_int {
    status(global::install_hooks())
}

#[unsafe(no_mangle)]
pub extern "C" fn forkguard_disable_hooks() -> c_int {
    status(global::disable_hooks())
}

#[unsafe(no_mangle)]
pub extern "C" fn forkguard_hooks_enabled() -> c_int {
    c_int::from(global::hooks_enabled())
}

#[unsafe(no_mangle)]
pub extern "C" fn forkguard_on_pre_fork(hook: Option<ForkHook>) -> c_int {
    register_hook(hook, |hook| {
        global::on_pre_fork(move || {
            hook();
            Ok(())
        })
        .map(drop)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn forkguard_on_post_fork_parent(hook: Option<ForkHook>) -> c_int {
    register_hook(hook, |hook| {
        global::on_post_fork_parent(move || {
            hook();
            Ok(())
        })
        .map(drop)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn forkguard_on_post_fork_child(hook: Option<ForkHook>) -> c_int {
    register_hook(hook, |hook| {
        global::on_post_fork_child(move || {
            hook();
            Ok(())
        })
        .map(drop)
    })
}

/// Watch a caller-owned mutex.
///
/// # Safety
///
/// `mutex` must be null or point at an initialised `pthread_mutex_t` that
/// stays valid, at the same address, for the rest of the process lifetime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn forkguard_watch_mutex(mutex: *mut libc::pthread_mutex_t) -> c_int {
    // SAFETY: forwarded from this function's contract.
    let Some(lock) = (unsafe { RawPthreadMutex::from_raw(mutex) }) else {
        return libc::EINVAL;
    };
    status(global::watch(Arc::new(lock)))
}

/// errno of the last callback failure seen by a fork handler, `0` if none.
/// Reading it clears it.
#[unsafe(no_mangle)]
pub extern "C" fn forkguard_take_fork_error() -> c_int {
    global::take_fork_error().map_or(0, |err| err.errno())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_arguments_are_einval() {
        assert_eq!(forkguard_on_pre_fork(None), libc::EINVAL);
        assert_eq!(forkguard_on_post_fork_parent(None), libc::EINVAL);
        assert_eq!(forkguard_on_post_fork_child(None), libc::EINVAL);
        // SAFETY: null is rejected before any dereference.
        assert_eq!(unsafe { forkguard_watch_mutex(std::ptr::null_mut()) }, libc::EINVAL);
    }

    #[test]
    fn status_maps_errors_to_errno() {
        assert_eq!(status(Ok(())), 0);
        assert_eq!(status(Err(ForkGuardError::NotInstalled)), libc::EPERM);
        assert_eq!(
            status(Err(ForkGuardError::OutOfMemory { what: "x" })),
            libc::ENOMEM
        );
    }
}
