//! Cargo-style status output for markersync
//!
//! ```text
//!   Connecting import@sftp.example.com
//!      Fetched 3 files (1.20 MiB)
//!     Advanced 3 state files
//!     Finished in 2.41s
//! ```

use std::io::Write as _;
use std::time::Instant;

use markersync_core::SyncReport;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const CONNECTING: &str = "Connecting";
    const FETCHED: &str = "Fetched";
    const ADVANCED: &str = "Advanced";
    const DELETED: &str = "Deleted";
    const FINISHED: &str = "Finished";
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().green().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

/// Report lines shown after a run, without the trailing "Finished"
fn summary_lines(report: &SyncReport) -> Vec<(&'static str, String)> {
    let mut lines = Vec::new();
    if report.fetch_requested {
        lines.push((
            Status::FETCHED,
            format!(
                "{} ({})",
                plural(report.fetched.len(), "file"),
                humansize::format_size(report.fetched_bytes, humansize::BINARY)
            ),
        ));
    }
    if !report.markers_created.is_empty() || !report.fetch_requested {
        lines.push((
            Status::ADVANCED,
            plural(report.markers_created.len(), "state file"),
        ));
    }
    if !report.deleted.is_empty() {
        lines.push((
            Status::DELETED,
            format!("{} on the remote side", plural(report.deleted.len(), "file")),
        ));
    }
    lines
}

/// Tracks one run for the final summary
pub struct RunProgress {
    start: Instant,
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn connecting(&self, user: &str, host: &str) {
        print_status(Status::CONNECTING, &format!("{user}@{host}"));
    }

    /// Show the final summary
    pub fn finish(&self, report: &SyncReport) {
        for (status, message) in summary_lines(report) {
            print_status(status, &message);
        }

        let elapsed = self.start.elapsed();
        let elapsed_str = if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        };
        let dry_run = if report.dry_run { " (dry-run)" } else { "" };

        if report.failed.is_empty() {
            print_status(Status::FINISHED, &format!("in {elapsed_str}{dry_run}"));
        } else {
            let mut term = console::Term::stderr();
            let style = console::Style::new().yellow().bold();
            let _ = writeln!(
                term,
                "{:>12} with {} failed in {}{}",
                style.apply_to(Status::FINISHED),
                report.failed.len(),
                elapsed_str,
                dry_run
            );
        }
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}
