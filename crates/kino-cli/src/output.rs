//! Output formatting for CLI

use serde::Serialize;

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// Something the CLI reports, printable as lines of text or as JSON
pub trait Report: Serialize {
    fn text_lines(&self) -> Vec<String>;
}

/// Format a report based on selected format
pub fn format_output<T: Report>(report: &T, format: &str) -> String {
    match OutputFormat::from(format) {
        OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Text => report.text_lines().join("\n"),
    }
}
