//! Forking, reaping and writing through the C `stdout` stream.

use std::ffi::{CString, c_int};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::thread;
use std::time::{Duration, Instant};

use forkguard_abi::CStdioStreams;
use serde::Serialize;

use crate::error::HarnessError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a forked child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
    /// Still running at the deadline; killed. Usually a deadlock.
    TimedOut,
}

impl ChildStatus {
    #[must_use]
    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::TimedOut => f.write_str("timed out (likely deadlocked)"),
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Fork; the child runs `child` and exits with its return value. The parent
/// waits up to `timeout` before killing the child.
pub fn run_in_child(
    timeout: Duration,
    child: impl FnOnce() -> c_int,
) -> Result<ChildStatus, HarnessError> {
    // SAFETY: the child runs `child` and then `_exit`s without returning into
    // the caller's stack.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(HarnessError::Fork(last_errno()));
    }
    if pid == 0 {
        let code = std::panic::catch_unwind(AssertUnwindSafe(child)).unwrap_or(101);
        // SAFETY: ends the child immediately, as after any fork.
        unsafe { libc::_exit(code) };
    }
    wait_with_deadline(pid, timeout)
}

fn wait_with_deadline(pid: libc::pid_t, timeout: Duration) -> Result<ChildStatus, HarnessError> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut status: c_int = 0;
        // SAFETY: `pid` is our child and `status` is a valid out pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            return Ok(decode(status));
        }
        if rc < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(HarnessError::Wait(errno));
        }
        if Instant::now() >= deadline {
            // SAFETY: signalling and reaping our own child.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
                libc::waitpid(pid, &mut status, 0);
            }
            return Ok(ChildStatus::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn decode(status: c_int) -> ChildStatus {
    if libc::WIFEXITED(status) {
        ChildStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ChildStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ChildStatus::Signaled(0)
    }
}

/// Write `line` and a newline to the C `stdout` stream, then flush.
///
/// Goes through the `FILE*` lock, so it blocks if that lock is stuck.
pub fn c_stdout_line(line: &str) -> Result<(), HarnessError> {
    let text = CString::new(format!("{line}\n")).map_err(|_| HarnessError::InteriorNul)?;
    let file = CStdioStreams::new().stdout().file();
    if file.is_null() {
        return Err(HarnessError::NoStdout);
    }
    // SAFETY: `file` is the live C stdout and `text` is NUL-terminated.
    unsafe {
        libc::fputs(text.as_ptr(), file);
        libc::fflush(file);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(ChildStatus::Exited(0).to_string(), "exited with status 0");
        assert_eq!(ChildStatus::Signaled(9).to_string(), "killed by signal 9");
        assert!(ChildStatus::Exited(0).success());
        assert!(!ChildStatus::TimedOut.success());
    }

    #[test]
    fn status_json_shape() {
        let json = serde_json::to_value(ChildStatus::Exited(3)).unwrap();
        assert_eq!(json["kind"], "exited");
        assert_eq!(json["value"], 3);
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(matches!(
            c_stdout_line("a\0b"),
            Err(HarnessError::InteriorNul)
        ));
    }
}
