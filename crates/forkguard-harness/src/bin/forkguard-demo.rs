//! CLI entrypoint for the forkguard fork scenarios.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use forkguard_core::DiagnosticFormat;
use forkguard_harness::{Scenario, ScenarioOptions, ScenarioReport};

/// Run fork-safety scenarios against the process coordinator.
#[derive(Debug, Parser)]
#[command(name = "forkguard-demo")]
#[command(about = "Fork-safety scenarios for forkguard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Report format: `text` (default) or `json`.
    #[arg(long, global = true, default_value = "text")]
    format: String,
    /// Seconds to wait for the child before declaring it deadlocked.
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register printing callbacks in all three phases and fork once.
    Callbacks,
    /// Hold the C stdout lock on another thread, fork, and write from the child.
    HeldStdout,
    /// Install then disable the hooks, and fork with failing callbacks.
    Disabled,
    /// Run every scenario in turn.
    All,
}

impl Command {
    fn scenarios(&self) -> Vec<Scenario> {
        match self {
            Self::Callbacks => vec![Scenario::Callbacks],
            Self::HeldStdout => vec![Scenario::HeldStdout],
            Self::Disabled => vec![Scenario::Disabled],
            Self::All => Scenario::ALL.to_vec(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = DiagnosticFormat::from_str_loose(&cli.format);
    let options = ScenarioOptions {
        // Callback lines would interleave with the JSON report.
        echo: format == DiagnosticFormat::Text,
        child_timeout: Duration::from_secs(cli.timeout),
    };

    let mut all_passed = true;
    for scenario in cli.command.scenarios() {
        match forkguard_harness::run(scenario, options).and_then(|report| render(&report, format)) {
            Ok((text, passed)) => {
                print!("{text}");
                all_passed &= passed;
            }
            Err(err) => {
                eprintln!("forkguard-demo: {}: {err}", scenario.as_str());
                all_passed = false;
            }
        }
    }

    if all_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn render(
    report: &ScenarioReport,
    format: DiagnosticFormat,
) -> Result<(String, bool), forkguard_harness::HarnessError> {
    Ok((report.render(format)?, report.passed))
}
