//! Runtime configuration.
//!
//! Read from the environment once, before any fork handler can run:
//! - `FORKGUARD_DIAG_FORMAT`: `text` (default) or `json`/`jsonl`. Selects how
//!   diagnostics are rendered on the error channel.
//! - `FORKGUARD_ADVISORY`: `on` (default) or `off`. When off, the pre-fork
//!   "possible deadlock" advisories are suppressed. Child fixup diagnostics are
//!   always written.

use std::sync::atomic::{AtomicU8, Ordering};

/// Rendering of diagnostic lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticFormat {
    /// One human-readable line per event.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl DiagnosticFormat {
    /// Parse from string (case-insensitive). Unknown values fall back to text.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "jsonl" | "structured" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkGuardConfig {
    pub format: DiagnosticFormat,
    /// Emit pre-fork advisories for locks held at fork time.
    pub advisory: bool,
}

impl Default for ForkGuardConfig {
    fn default() -> Self {
        Self {
            format: DiagnosticFormat::Text,
            advisory: true,
        }
    }
}

impl ForkGuardConfig {
    /// Configuration from `FORKGUARD_*` environment variables (cached).
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            format: diagnostic_format(),
            advisory: advisory_enabled(),
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: DiagnosticFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_advisory(mut self, advisory: bool) -> Self {
        self.advisory = advisory;
        self
    }
}

fn parse_switch(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "off" | "0" | "false" | "no" | "disabled"
    )
}

// Atomic caches: 0=unresolved, 255=resolving, otherwise a resolved value.
// A reentrant or racing caller that sees RESOLVING gets the default instead of
// blocking; blocking here could stall a thread that is about to fork.
const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

static CACHED_FORMAT: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CACHED_ADVISORY: AtomicU8 = AtomicU8::new(UNRESOLVED);

const FORMAT_TEXT: u8 = 1;
const FORMAT_JSON: u8 = 2;
const SWITCH_ON: u8 = 1;
const SWITCH_OFF: u8 = 2;

fn resolve_cached(slot: &AtomicU8, default: u8, resolve: impl FnOnce() -> u8) -> u8 {
    let cached = slot.load(Ordering::Acquire);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING {
        return default;
    }
    if slot
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        let v = slot.load(Ordering::Acquire);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            default
        };
    }
    let value = resolve();
    slot.store(value, Ordering::Release);
    value
}

/// Configured diagnostic format (reads env on first call, cached thereafter).
#[must_use]
pub fn diagnostic_format() -> DiagnosticFormat {
    let v = resolve_cached(&CACHED_FORMAT, FORMAT_TEXT, || {
        match std::env::var("FORKGUARD_DIAG_FORMAT")
            .map(|v| DiagnosticFormat::from_str_loose(&v))
            .unwrap_or_default()
        {
            DiagnosticFormat::Text => FORMAT_TEXT,
            DiagnosticFormat::Json => FORMAT_JSON,
        }
    });
    if v == FORMAT_JSON {
        DiagnosticFormat::Json
    } else {
        DiagnosticFormat::Text
    }
}

/// Whether pre-fork advisories are enabled (reads env on first call).
#[must_use]
pub fn advisory_enabled() -> bool {
    let v = resolve_cached(&CACHED_ADVISORY, SWITCH_ON, || {
        match std::env::var("FORKGUARD_ADVISORY") {
            Ok(raw) if !parse_switch(&raw) => SWITCH_OFF,
            _ => SWITCH_ON,
        }
    });
    v != SWITCH_OFF
}
