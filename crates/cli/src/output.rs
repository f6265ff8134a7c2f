//! Output formatting utilities

use chrono::{DateTime, Local};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use std::time::SystemTime;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table; `empty` is shown instead of an empty table
pub fn print_table<T: Tabled>(rows: Vec<T>, empty: &str) {
    if rows.is_empty() {
        print_warning(empty);
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a section title underlined with `=`
pub fn print_title(title: &str) {
    println!("{}", title.bold());
    println!("{}", "=".repeat(60));
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print a warning on stderr, keeping stdout parseable
pub fn eprint_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Format a file modification time in local time
pub fn format_mtime(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format a unix timestamp in seconds in local time
pub fn format_unix(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Unix seconds of a file modification time, for JSON output
pub fn unix_secs(time: SystemTime) -> i64 {
    DateTime::<chrono::Utc>::from(time).timestamp()
}

/// Check or cross mark for a present/missing file
pub fn color_presence(present: bool) -> String {
    if present {
        "✓".green().to_string()
    } else {
        "✗".red().to_string()
    }
}

/// Color a weight by how much of the ensemble it carries
pub fn color_weight(weight: f64) -> String {
    let formatted = format!("{:.4}", weight);
    if weight >= 0.3 {
        formatted.green().to_string()
    } else if weight >= 0.1 {
        formatted.yellow().to_string()
    } else {
        formatted.normal().to_string()
    }
}

/// Format an optional score, `-` when absent
pub fn format_score(score: Option<f64>) -> String {
    score
        .map(|s| format!("{:.4}", s))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00Ki");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00Mi");
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(Some(0.95)), "0.9500");
        assert_eq!(format_score(None), "-");
    }

    #[test]
    fn test_unix_secs() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        assert_eq!(unix_secs(t), 1_700_000_000);
    }
}
