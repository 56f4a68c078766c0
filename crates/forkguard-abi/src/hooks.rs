//! Registration table and the `pthread_atfork` trampolines.
//!
//! `pthread_atfork` entries cannot be removed, so the process registers one
//! triplet of trampolines, once, and the trampolines dispatch to every
//! coordinator in a fixed-size table. Slots are append-only atomics: the
//! handlers read them without taking any lock.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use forkguard_core::{CallbackError, ChildPhase, ForkCoordinator, ForkGuardError, force_release};
use parking_lot::Mutex;

/// Maximum number of coordinators one process can install.
pub const MAX_COORDINATORS: usize = 16;

static SLOTS: [AtomicPtr<ForkCoordinator>; MAX_COORDINATORS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_COORDINATORS];
static SLOT_COUNT: AtomicUsize = AtomicUsize::new(0);
/// Slot count seen by the pre-fork trampoline, so that the parent and child
/// trampolines resume exactly the coordinators that were held.
static FORKING_COUNT: AtomicUsize = AtomicUsize::new(0);
static ATFORK_REGISTERED: AtomicBool = AtomicBool::new(false);
static TABLE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Add `coordinator` to the table, registering the trampolines with the OS on
/// first use. Registering the same coordinator again is a no-op.
pub fn register_coordinator(coordinator: &'static ForkCoordinator) -> Result<(), ForkGuardError> {
    let _table = TABLE_LOCK.lock();
    ensure_atfork()?;

    let target = ptr::from_ref(coordinator).cast_mut();
    let count = SLOT_COUNT.load(Ordering::Acquire);
    if SLOTS[..count]
        .iter()
        .any(|slot| slot.load(Ordering::Acquire) == target)
    {
        return Ok(());
    }
    let Some(slot) = SLOTS.get(count) else {
        return Err(ForkGuardError::OutOfMemory {
            what: "coordinator slot",
        });
    };
    slot.store(target, Ordering::Release);
    SLOT_COUNT.store(count + 1, Ordering::Release);
    Ok(())
}

/// Number of coordinators currently in the table.
#[must_use]
pub fn registered_count() -> usize {
    SLOT_COUNT.load(Ordering::Acquire)
}

fn ensure_atfork() -> Result<(), ForkGuardError> {
    if ATFORK_REGISTERED.load(Ordering::Acquire) {
        return Ok(());
    }
    // SAFETY: the trampolines are `extern "C"` functions with the expected
    // signature that never unwind.
    let rc = unsafe {
        libc::pthread_atfork(
            Some(prepare_trampoline),
            Some(parent_trampoline),
            Some(child_trampoline),
        )
    };
    if rc != 0 {
        return Err(ForkGuardError::Registration { errno: rc });
    }
    ATFORK_REGISTERED.store(true, Ordering::Release);
    Ok(())
}

fn coordinators(count: usize) -> impl DoubleEndedIterator<Item = &'static ForkCoordinator> {
    SLOTS[..count.min(MAX_COORDINATORS)].iter().filter_map(|slot| {
        let raw = slot.load(Ordering::Acquire);
        // SAFETY: slots only ever hold pointers derived from
        // `&'static ForkCoordinator`.
        unsafe { raw.cast_const().as_ref() }
    })
}

/// A callback asked for the process to end: honour it from inside the handler.
fn finish(result: Result<(), CallbackError>) {
    if let Err(CallbackError::Exit(code)) = result {
        std::process::exit(code);
    }
}

unsafe extern "C" fn prepare_trampoline() {
    let count = SLOT_COUNT.load(Ordering::Acquire);
    FORKING_COUNT.store(count, Ordering::Release);
    // Reverse order, as POSIX orders prepare handlers.
    for coordinator in coordinators(count).rev() {
        finish(coordinator.pre_fork());
    }
}

unsafe extern "C" fn parent_trampoline() {
    for coordinator in coordinators(FORKING_COUNT.load(Ordering::Acquire)) {
        finish(coordinator.post_fork_parent());
    }
}

unsafe extern "C" fn child_trampoline() {
    // SAFETY: invoked by the C runtime in the child right after fork(); the
    // calling thread is the only one in the process.
    let child = unsafe { ChildPhase::assume() };
    // A registration racing the fork leaves the table lock held here.
    if TABLE_LOCK.is_locked() {
        force_release(&TABLE_LOCK, &child);
    }
    for coordinator in coordinators(FORKING_COUNT.load(Ordering::Acquire)) {
        finish(coordinator.post_fork_child(&child));
    }
}
