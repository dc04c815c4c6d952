//! Terminal output for the CLI
//!
//! A spinner while a command is awaited, and styled summaries of bulk and
//! migration statuses.

use crate::bulk::{BulkState, BulkStatus};
use crate::migration::MigrationStatusView;
use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner that follows one bulk command
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a spinner and start ticking
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        let spinner = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(spinner);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the display from a status
    pub fn update(&self, status: &BulkStatus) {
        self.bar.set_message(progress_line(status));
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish and clear the spinner
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line progress of a command
pub fn progress_line(status: &BulkStatus) -> String {
    let total = if status.has_total() {
        format_number(status.total as u64)
    } else {
        "?".to_string()
    };
    let mut line = format!(
        "{} | Processed: {}/{}",
        status.state,
        format_number(status.processed),
        total
    );
    if let Some(count) = status.bucket_count {
        line.push_str(&format!(
            " | Buckets: {}/{}",
            format_number(status.buckets_done),
            format_number(count)
        ));
    }
    if status.error_count > 0 {
        line.push_str(&format!(" | Errors: {}", format_number(status.error_count)));
    }
    line
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

fn styled_state(state: BulkState) -> StyledObject<&'static str> {
    let s = style(state.as_str()).bold();
    match state {
        BulkState::Completed => s.green(),
        BulkState::Aborted => s.red(),
        _ => s.cyan(),
    }
}

/// Print the full status of one command
pub fn print_status(status: &BulkStatus) {
    println!();
    println!(
        "{} {}",
        style("Bulk command").cyan().bold(),
        status.command_id
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("State:").bold(), styled_state(status.state));
    println!("  {} {}", style("Action:").bold(), status.action);
    println!("  {} {}", style("User:").bold(), status.username);
    if status.has_total() {
        println!(
            "  {} {}",
            style("Total:").bold(),
            format_number(status.total as u64)
        );
    } else {
        println!("  {} unknown", style("Total:").bold());
    }
    println!(
        "  {} {}",
        style("Processed:").bold(),
        format_number(status.processed)
    );
    if status.error_count > 0 {
        println!(
            "  {} {}",
            style("Errors:").yellow().bold(),
            format_number(status.error_count)
        );
    }
    if let Some(message) = &status.error_message {
        println!("  {} {}", style("Last error:").yellow().bold(), message);
    }
    println!(
        "  {} {}",
        style("Submitted:").bold(),
        status.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(at) = status.completed_at {
        let elapsed = at.signed_duration_since(status.submitted_at);
        println!(
            "  {} {} ({:.1}s)",
            style("Finished:").bold(),
            at.format("%Y-%m-%d %H:%M:%S UTC"),
            elapsed.num_milliseconds() as f64 / 1000.0
        );
    }
    println!();
}

/// Print one line per command
pub fn print_statuses(statuses: &[BulkStatus]) {
    if statuses.is_empty() {
        println!("{}", style("No bulk commands").dim());
        return;
    }
    for status in statuses {
        println!(
            "{}  {:<18} {:<14} {}",
            status.command_id,
            styled_state(status.state),
            status.action,
            progress_line(status)
        );
    }
}

/// Print a migration status
pub fn print_migration(view: &MigrationStatusView) {
    println!();
    println!(
        "{} {}",
        style("Migration").cyan().bold(),
        view.migration_id
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("State:").bold(), view.state);
    println!("  {} {}", style("Running:").bold(), view.running);
    if let Some(step) = &view.step {
        println!("  {} {}", style("Step:").bold(), step);
    }
    if let Some(command_id) = &view.command_id {
        println!("  {} {}", style("Command:").bold(), command_id);
    }
    if let Some(error) = &view.last_error {
        println!("  {} {}", style("Last error:").red().bold(), error);
    }
    println!();
}

/// Print a header for commands that run a local processor
pub fn print_header(database: &str, partitions: u32, workers: usize) {
    println!();
    println!(
        "{} {}",
        style("bulk-engine").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Database:").bold(), database);
    println!("  {} {}", style("Partitions:").bold(), partitions);
    println!("  {} {}", style("Workers:").bold(), workers);
    println!();
}
