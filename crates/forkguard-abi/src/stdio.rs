//! C stdio standard-stream host.
//!
//! The standard streams of a C process are the `stdout`/`stderr` `FILE*`
//! globals, each guarded by a recursive stream lock. The current pointer is
//! read on every call since the host may reassign it.

use std::ffi::c_int;

use forkguard_core::{
    ForkLock, ProbeError, ResourceKind, StdStreams, StreamUnavailable, TryAcquire, probe_with,
};

unsafe extern "C" {
    #[cfg_attr(target_os = "macos", link_name = "__stdoutp")]
    static mut stdout: *mut libc::FILE;
    #[cfg_attr(target_os = "macos", link_name = "__stderrp")]
    static mut stderr: *mut libc::FILE;

    fn flockfile(stream: *mut libc::FILE);
    fn ftrylockfile(stream: *mut libc::FILE) -> c_int;
    fn funlockfile(stream: *mut libc::FILE);
}

// Recursion depth past which a stream lock is assumed corrupt rather than
// deeply nested.
const MAX_DRAIN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdFile {
    Out,
    Err,
}

/// The lock of one C standard stream.
#[derive(Debug)]
pub struct CFileLock {
    which: StdFile,
}

impl CFileLock {
    const fn new(which: StdFile) -> Self {
        Self { which }
    }

    /// The stream's current `FILE*`, possibly null.
    #[must_use]
    pub fn file(&self) -> *mut libc::FILE {
        // SAFETY: plain read of the C library's stream pointers.
        unsafe {
            match self.which {
                StdFile::Out => stdout,
                StdFile::Err => stderr,
            }
        }
    }

    #[must_use]
    pub fn resource(&self) -> ResourceKind {
        match self.which {
            StdFile::Out => ResourceKind::StandardOutput,
            StdFile::Err => ResourceKind::StandardError,
        }
    }

    /// Take the stream lock on the calling thread (`flockfile`).
    pub fn lock(&self) -> Option<CFileGuard> {
        let file = self.file();
        if file.is_null() {
            return None;
        }
        // SAFETY: `file` is the live standard stream.
        unsafe { flockfile(file) };
        Some(CFileGuard { file })
    }
}

impl ForkLock for CFileLock {
    fn is_held(&self) -> Result<bool, ProbeError> {
        let file = self.file();
        if file.is_null() {
            return Ok(false);
        }
        probe_with(
            || {
                // SAFETY: `file` is the live standard stream.
                if unsafe { ftrylockfile(file) } == 0 {
                    TryAcquire::Acquired
                } else {
                    TryAcquire::Busy
                }
            },
            // SAFETY: the probe acquired the lock on this thread.
            || unsafe { funlockfile(file) },
        )
    }

    unsafe fn release_forced(&self) {
        let file = self.file();
        if file.is_null() {
            return;
        }
        for _ in 0..MAX_DRAIN {
            // SAFETY: sole thread of the child; unlocking drops one level of
            // the dead owner's recursive hold.
            unsafe { funlockfile(file) };
            // SAFETY: as above.
            if unsafe { ftrylockfile(file) } == 0 {
                // SAFETY: acquired just above.
                unsafe { funlockfile(file) };
                return;
            }
        }
    }
}

/// Holds a C standard stream lock until dropped.
#[derive(Debug)]
#[must_use = "the stream is unlocked when the guard is dropped"]
pub struct CFileGuard {
    file: *mut libc::FILE,
}

impl Drop for CFileGuard {
    fn drop(&mut self) {
        // SAFETY: acquired by `CFileLock::lock` on this thread.
        unsafe { funlockfile(self.file) };
    }
}

/// [`StdStreams`] host backed by the C library's `stdout`/`stderr`.
#[derive(Debug)]
pub struct CStdioStreams {
    stdout: CFileLock,
    stderr: CFileLock,
}

impl Default for CStdioStreams {
    fn default() -> Self {
        Self::new()
    }
}

impl CStdioStreams {
    pub const fn new() -> Self {
        Self {
            stdout: CFileLock::new(StdFile::Out),
            stderr: CFileLock::new(StdFile::Err),
        }
    }

    #[must_use]
    pub fn stdout(&self) -> &CFileLock {
        &self.stdout
    }

    #[must_use]
    pub fn stderr(&self) -> &CFileLock {
        &self.stderr
    }

    fn available(lock: &CFileLock) -> Result<&dyn ForkLock, StreamUnavailable> {
        if lock.file().is_null() {
            Err(StreamUnavailable::Missing(lock.resource()))
        } else {
            Ok(lock)
        }
    }
}

impl StdStreams for CStdioStreams {
    fn stdout_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable> {
        Self::available(&self.stdout)
    }

    fn stderr_lock(&self) -> Result<&dyn ForkLock, StreamUnavailable> {
        Self::available(&self.stderr)
    }
}
