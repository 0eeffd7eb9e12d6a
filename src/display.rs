//! Colored terminal output for monitor events.
//!
//! Human mode prints one colored line per event. JSON mode prints one
//! object per line for piping into other tools.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;
use serde_json::json;

use crate::integrity::BaselineReport;
use crate::watch::{Incident, MismatchAlert, MonitorEvent, RootReport, Severity, WatchError};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Maximum length for truncated display strings.
const HASH_DISPLAY_LEN: usize = 16;

/// Truncate a string to a maximum length, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

/// Output format for monitor events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Human,
    Json,
}

/// Render an event as a single JSON line.
#[must_use]
pub fn event_json(event: &MonitorEvent) -> serde_json::Value {
    match event {
        MonitorEvent::Incident(incident) => json!({
            "type": "incident",
            "timestamp": incident.last_seen,
            "path": incident.path,
            "events": incident.kinds,
            "severity": incident.severity,
            "records": incident.records,
            "first_seen": incident.first_seen,
        }),
        MonitorEvent::Mismatch(alert) => json!({
            "type": "mismatch",
            "timestamp": alert.detected_at,
            "path": alert.path,
            "old_hash": alert.old_hash,
            "new_hash": alert.new_hash,
            "severity": Severity::Critical,
        }),
        MonitorEvent::Error(error) => json!({
            "type": "error",
            "timestamp": Utc::now(),
            "message": error.to_string(),
            "severity": Severity::Warning,
        }),
    }
}

/// Print an event in the chosen format.
pub fn print_event(event: &MonitorEvent, mode: OutputMode) {
    match mode {
        OutputMode::Json => println!("{}", event_json(event)),
        OutputMode::Human => match event {
            MonitorEvent::Incident(incident) => print_incident(incident),
            MonitorEvent::Mismatch(alert) => print_mismatch(alert),
            MonitorEvent::Error(error) => print_watch_error(error),
        },
    }
    let _ = io::stdout().flush();
}

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Info => "[INFO]".green().bold().to_string(),
        Severity::Warning => "[WARN]".yellow().bold().to_string(),
        Severity::Critical => "[CRIT]".red().bold().to_string(),
    }
}

/// Print a flushed incident.
pub fn print_incident(incident: &Incident) {
    println!(
        "{} {} {} {} {}",
        incident.last_seen.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string().dimmed(),
        severity_label(incident.severity),
        incident.path.display().cyan(),
        incident.kind_names(),
        format!("records={}", incident.records).dimmed()
    );
}

/// Print an integrity mismatch.
pub fn print_mismatch(alert: &MismatchAlert) {
    println!(
        "{} {} {} content changed {} -> {}",
        alert.detected_at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string().dimmed(),
        "[MISMATCH]".red().bold(),
        alert.path.display().cyan(),
        truncate(&alert.old_hash, HASH_DISPLAY_LEN).dimmed(),
        truncate(&alert.new_hash, HASH_DISPLAY_LEN).red()
    );
}

/// Print a non-fatal watch error.
pub fn print_watch_error(error: &WatchError) {
    eprintln!(
        "{} {} {}",
        timestamp().dimmed(),
        "[WARN]".yellow().bold(),
        error
    );
}

/// Print a fatal error message.
pub fn print_error(message: &str) {
    eprintln!("{} {} {}", timestamp().dimmed(), "[ERROR]".red().bold(), message.red());
}

/// Print the outcome of a baseline scan.
pub fn print_baseline(report: &BaselineReport, rebuilt: bool) {
    let action = if rebuilt { "rebuilt" } else { "initialized" };
    eprintln!(
        "{} {} Baseline {action}: {} files hashed, {} skipped",
        timestamp().dimmed(),
        "[BASELINE]".blue().bold(),
        report.hashed,
        report.skipped
    );
}

/// Print the watched roots.
pub fn print_watching(report: &RootReport) {
    for root in &report.roots {
        eprintln!(
            "{} {} {}",
            timestamp().dimmed(),
            "[WATCH]".blue().bold(),
            root.display().cyan()
        );
    }
    eprintln!(
        "{} {} {} directories registered",
        timestamp().dimmed(),
        "[WATCH]".blue().bold(),
        report.directories
    );
    for failure in &report.failures {
        print_watch_error(failure);
    }
}
