//! Diagnostic sink writing straight to a file descriptor.
//!
//! Goes through `write(2)` only, never through a `FILE*` or Rust's `Stderr`:
//! in the child those are the very locks that may be stuck.

use std::ffi::{c_int, c_void};

use forkguard_core::{Diagnostic, DiagnosticFormat, DiagnosticSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFdSink {
    fd: c_int,
}

impl RawFdSink {
    #[must_use]
    pub const fn new(fd: c_int) -> Self {
        Self { fd }
    }

    /// Sink on the process error channel.
    #[must_use]
    pub const fn stderr() -> Self {
        Self::new(libc::STDERR_FILENO)
    }

    #[must_use]
    pub const fn fd(&self) -> c_int {
        self.fd
    }

    fn write_all(&self, mut buf: &[u8]) {
        while !buf.is_empty() {
            // SAFETY: `buf` is a valid slice for the duration of the call.
            let rc = unsafe { libc::write(self.fd, buf.as_ptr().cast::<c_void>(), buf.len()) };
            if rc > 0 {
                buf = &buf[rc as usize..];
                continue;
            }
            if rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            // Diagnostics are best effort.
            return;
        }
    }
}

impl DiagnosticSink for RawFdSink {
    fn emit(&self, diagnostic: &Diagnostic, format: DiagnosticFormat) {
        self.write_all(diagnostic.render(format).as_bytes());
    }
}
