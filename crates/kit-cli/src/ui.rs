//! Terminal presentation helpers.

use std::collections::HashSet;
use std::io::IsTerminal;
use std::sync::Mutex;

use crossterm::style::Stylize;
use kit_core::Reporter;
use kit_schema::Reference;

/// Progress lines on stderr, so stdout stays parseable.
#[derive(Debug, Default)]
pub struct TerminalReporter {
    quiet: bool,
    started: Mutex<HashSet<String>>,
}

impl TerminalReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            started: Mutex::new(HashSet::new()),
        }
    }
}

impl Reporter for TerminalReporter {
    fn downloading(&self, locator: &str, _current: u64, total: Option<u64>) {
        if self.quiet {
            return;
        }
        let first = self
            .started
            .lock()
            .map(|mut s| s.insert(locator.to_string()))
            .unwrap_or(false);
        if first {
            match total {
                Some(bytes) => eprintln!("  fetching {locator} ({})", format_size(bytes)),
                None => eprintln!("  fetching {locator}"),
            }
        }
    }

    fn extracting(&self, reference: &Reference) {
        if !self.quiet {
            eprintln!("  unpacking {reference}");
        }
    }

    fn done(&self, reference: &Reference, detail: &str) {
        if !self.quiet {
            eprintln!("  {reference} {detail}");
        }
    }

    fn failed(&self, reference: &Reference, reason: &str) {
        eprintln!("  {reference} failed: {reason}");
    }

    fn removing(&self, reference: &Reference) {
        if !self.quiet {
            eprintln!("  removing {reference}");
        }
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }
}

/// Bold on a terminal, plain otherwise.
pub fn heading(text: &str) -> String {
    if std::io::stdout().is_terminal() {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

/// Quote `value` for POSIX shells when it contains anything unsafe.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
