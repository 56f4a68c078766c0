//! End-to-end fork scenarios on the process coordinator.
//!
//! Each run installs the global hooks, registers its callbacks, forks once
//! and tears the registrations down again, so scenarios can run back to back
//! in one process.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use forkguard_abi::CStdioStreams;
use forkguard_core::{CallbackError, DiagnosticFormat, ForkCoordinator, ForkGuardError};
use serde::Serialize;

use crate::error::HarnessError;
use crate::process::{ChildStatus, c_stdout_line, run_in_child};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Callbacks in all three phases, one fork.
    Callbacks,
    /// C `stdout` held by another thread while the process forks.
    HeldStdout,
    /// Installed then disabled hooks.
    Disabled,
}

impl Scenario {
    pub const ALL: [Self; 3] = [Self::Callbacks, Self::HeldStdout, Self::Disabled];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Callbacks => "callbacks",
            Self::HeldStdout => "held-stdout",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioOptions {
    /// Print a line from each callback on C `stdout`.
    pub echo: bool,
    /// How long to wait for the child before declaring it deadlocked.
    pub child_timeout: Duration,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            echo: false,
            child_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub passed: bool,
    pub child: ChildStatus,
    pub pre_fork_calls: usize,
    pub parent_calls: usize,
    pub fork_error: Option<String>,
}

impl ScenarioReport {
    /// Render for the terminal: a few `key: value` lines, or one JSON object.
    pub fn render(&self, format: DiagnosticFormat) -> Result<String, HarnessError> {
        match format {
            DiagnosticFormat::Json => Ok(serde_json::to_string(self)? + "\n"),
            DiagnosticFormat::Text => {
                let mut out = String::new();
                let _ = writeln!(out, "scenario: {}", self.scenario.as_str());
                let _ = writeln!(out, "child: {}", self.child);
                let _ = writeln!(
                    out,
                    "parent callbacks: pre-fork={} post-fork-parent={}",
                    self.pre_fork_calls, self.parent_calls
                );
                if let Some(err) = &self.fork_error {
                    let _ = writeln!(out, "fork error: {err}");
                }
                let _ = writeln!(out, "result: {}", if self.passed { "ok" } else { "FAILED" });
                Ok(out)
            }
        }
    }
}

/// Global hooks installed for the duration of one scenario.
struct Session {
    coordinator: &'static ForkCoordinator,
}

impl Session {
    fn begin() -> Result<Self, HarnessError> {
        forkguard_abi::install_hooks()?;
        Ok(Self {
            coordinator: forkguard_abi::global(),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.coordinator.teardown();
        let _ = self.coordinator.disable();
    }
}

fn counter(count: &Arc<AtomicUsize>) -> Arc<AtomicUsize> {
    Arc::clone(count)
}

fn echo(enabled: bool, line: &str) -> Result<(), CallbackError> {
    if enabled {
        c_stdout_line(line).map_err(|err| CallbackError::failed(err.to_string()))?;
    }
    Ok(())
}

pub fn run(scenario: Scenario, options: ScenarioOptions) -> Result<ScenarioReport, HarnessError> {
    match scenario {
        Scenario::Callbacks => run_callbacks(options),
        Scenario::HeldStdout => run_held_stdout(options),
        Scenario::Disabled => run_disabled(options),
    }
}

fn run_callbacks(options: ScenarioOptions) -> Result<ScenarioReport, HarnessError> {
    let session = Session::begin()?;
    let pre = Arc::new(AtomicUsize::new(0));
    let parent = Arc::new(AtomicUsize::new(0));
    let child = Arc::new(AtomicUsize::new(0));

    let pre_cb = counter(&pre);
    session.coordinator.on_pre_fork(move || {
        pre_cb.fetch_add(1, Ordering::SeqCst);
        echo(options.echo, "pre-fork")
    })?;
    let parent_cb = counter(&parent);
    session.coordinator.on_post_fork_parent(move || {
        parent_cb.fetch_add(1, Ordering::SeqCst);
        echo(options.echo, "post-fork-parent")
    })?;
    let child_cb = counter(&child);
    session.coordinator.on_post_fork_child(move || {
        child_cb.fetch_add(1, Ordering::SeqCst);
        echo(options.echo, "post-fork-child")
    })?;

    let status = run_in_child(options.child_timeout, || {
        let ok = child.load(Ordering::SeqCst) == 1 && parent.load(Ordering::SeqCst) == 0;
        if ok { 0 } else { 1 }
    })?;

    let pre_fork_calls = pre.load(Ordering::SeqCst);
    let parent_calls = parent.load(Ordering::SeqCst);
    let fork_error = session.coordinator.take_fork_error();
    Ok(ScenarioReport {
        scenario: Scenario::Callbacks,
        passed: status.success() && pre_fork_calls == 1 && parent_calls == 1 && fork_error.is_none(),
        child: status,
        pre_fork_calls,
        parent_calls,
        fork_error: fork_error.as_ref().map(ForkGuardError::to_string),
    })
}

fn run_held_stdout(options: ScenarioOptions) -> Result<ScenarioReport, HarnessError> {
    let session = Session::begin()?;

    let (locked_tx, locked_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = thread::spawn(move || {
        let _held = CStdioStreams::new().stdout().lock();
        let _ = locked_tx.send(());
        let _ = release_rx.recv();
    });
    let _ = locked_rx.recv();

    let status = run_in_child(options.child_timeout, || {
        match c_stdout_line("child wrote to stdout") {
            Ok(()) => 0,
            Err(_) => 1,
        }
    });

    drop(release_tx);
    let _ = holder.join();
    let status = status?;

    if options.echo {
        let _ = c_stdout_line("parent wrote to stdout");
    }
    let fork_error = session.coordinator.take_fork_error();
    Ok(ScenarioReport {
        scenario: Scenario::HeldStdout,
        passed: status.success(),
        child: status,
        pre_fork_calls: 0,
        parent_calls: 0,
        fork_error: fork_error.as_ref().map(ForkGuardError::to_string),
    })
}

fn run_disabled(options: ScenarioOptions) -> Result<ScenarioReport, HarnessError> {
    let session = Session::begin()?;
    session.coordinator.disable()?;

    let pre = Arc::new(AtomicUsize::new(0));
    let parent = Arc::new(AtomicUsize::new(0));
    let child = Arc::new(AtomicUsize::new(0));

    let pre_cb = counter(&pre);
    session.coordinator.on_pre_fork(move || {
        pre_cb.fetch_add(1, Ordering::SeqCst);
        Err(CallbackError::failed("pre-fork callback ran while disabled"))
    })?;
    let parent_cb = counter(&parent);
    session.coordinator.on_post_fork_parent(move || {
        parent_cb.fetch_add(1, Ordering::SeqCst);
        Err(CallbackError::failed("parent callback ran while disabled"))
    })?;
    let child_cb = counter(&child);
    session.coordinator.on_post_fork_child(move || {
        child_cb.fetch_add(1, Ordering::SeqCst);
        Err(CallbackError::failed("child callback ran while disabled"))
    })?;

    let status = run_in_child(options.child_timeout, || {
        i32::try_from(child.load(Ordering::SeqCst)).unwrap_or(i32::MAX)
    })?;

    let pre_fork_calls = pre.load(Ordering::SeqCst);
    let parent_calls = parent.load(Ordering::SeqCst);
    let fork_error = session.coordinator.take_fork_error();
    Ok(ScenarioReport {
        scenario: Scenario::Disabled,
        passed: status.success() && pre_fork_calls == 0 && parent_calls == 0 && fork_error.is_none(),
        child: status,
        pre_fork_calls,
        parent_calls,
        fork_error: fork_error.as_ref().map(ForkGuardError::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ScenarioReport {
        ScenarioReport {
            scenario: Scenario::HeldStdout,
            passed: false,
            child: ChildStatus::TimedOut,
            pre_fork_calls: 0,
            parent_calls: 0,
            fork_error: None,
        }
    }

    #[test]
    fn text_report_flags_failure() {
        let text = report().render(DiagnosticFormat::Text).unwrap();
        assert!(text.starts_with("scenario: held-stdout\n"));
        assert!(text.contains("child: timed out (likely deadlocked)\n"));
        assert!(text.ends_with("result: FAILED\n"));
    }

    #[test]
    fn json_report_is_one_line() {
        let json = report().render(DiagnosticFormat::Json).unwrap();
        assert_eq!(json.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["scenario"], "held-stdout");
        assert_eq!(value["child"]["kind"], "timed_out");
        assert_eq!(value["passed"], false);
    }
}
