//! Rendering of finished scan reports for the CLI and API

use crate::{error::ScanError, models::FileError, models::ScanReport, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

const MIB: f64 = 1024.0 * 1024.0;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl FromStr for OutputFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" | "txt" => Ok(OutputFormat::Text),
            other => Err(ScanError::InvalidConfig(format!("unknown report format: {}", other))),
        }
    }
}

/// Configuration for report formatting
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// List every member file of each group
    pub include_details: bool,
    /// Only render the first N groups (already sorted by wasted space)
    pub max_groups: Option<usize>,
    /// Include per-file errors
    pub include_errors: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_details: true,
            max_groups: None,
            include_errors: true,
        }
    }
}

/// Renders `ScanReport`s as JSON or plain text
#[derive(Debug, Clone, Default)]
pub struct ReportGenerator {
    config: ReportConfig,
}

impl ReportGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ReportConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self, report: &ScanReport, format: OutputFormat) -> Result<String> {
        let mut report = report.clone();
        if let Some(max) = self.config.max_groups {
            report.duplicate_groups.truncate(max);
        }
        if !self.config.include_errors {
            report.errors.clear();
        }

        match format {
            OutputFormat::Json => self.generate_json(&report),
            OutputFormat::Text => Ok(self.generate_text(&report)),
        }
    }

    pub fn generate_json(&self, report: &ScanReport) -> Result<String> {
        if self.config.include_details {
            return Ok(serde_json::to_string_pretty(report)?);
        }

        let simplified = serde_json::json!({
            "status": report.status,
            "summary": report.summary,
            "duplicate_groups": report.duplicate_groups.iter().map(|group| {
                serde_json::json!({
                    "id": group.id,
                    "hash": group.hash,
                    "algorithm": group.algorithm,
                    "file_count": group.file_count,
                    "total_size": group.total_size,
                    "space_wasted": group.space_wasted,
                })
            }).collect::<Vec<_>>(),
            "errors": report.errors,
        });
        Ok(serde_json::to_string_pretty(&simplified)?)
    }

    pub fn generate_text(&self, report: &ScanReport) -> String {
        let mut out = String::new();
        let summary = &report.summary;

        // Writing into a String cannot fail
        let _ = writeln!(out, "=== Duplicate Scan Report: {} ===\n", report.status.name);
        let _ = writeln!(out, "Scan #{} ({})", report.status.scan_id, report.status.state);
        let _ = writeln!(out, "  Files discovered: {}", summary.files_discovered);
        let _ = writeln!(out, "  Files processed: {}", summary.files_processed);
        let _ = writeln!(out, "  Files failed: {}", summary.files_failed);
        let _ = writeln!(out, "  Duplicate groups: {}", summary.duplicate_groups);
        let _ = writeln!(out, "  Duplicate files: {}", summary.duplicate_files);
        let _ = writeln!(
            out,
            "  Space wasted: {} bytes ({:.2} MB)",
            summary.space_wasted,
            summary.space_wasted as f64 / MIB
        );
        let _ = writeln!(out, "  Elapsed: {:.2} seconds\n", report.status.elapsed_seconds());

        if report.duplicate_groups.is_empty() {
            out.push_str("No duplicate files found.\n\n");
        } else {
            out.push_str("Duplicate groups (largest waste first):\n\n");
            for (index, group) in report.duplicate_groups.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}. {} files, {} bytes each, {} bytes wasted",
                    index + 1,
                    group.file_count,
                    group.total_size,
                    group.space_wasted
                );
                let _ = writeln!(out, "   {}: {}", group.algorithm, group.hash);
                if self.config.include_details {
                    for file in &group.files {
                        let _ = writeln!(out, "     - {}", file.path.display());
                    }
                }
                out.push('\n');
            }
        }

        if !report.errors.is_empty() {
            let _ = writeln!(out, "Errors ({}):", report.errors.len());
            for error in &report.errors {
                out.push_str(&format_error(error));
            }
        }

        out
    }

    /// Render and write a report to `path`
    pub fn save_report(&self, report: &ScanReport, format: OutputFormat, path: &Path) -> Result<()> {
        let content = self.generate(report, format)?;
        std::fs::write(path, content).map_err(|e| ScanError::from_io(path, e))
    }
}

fn format_error(error: &FileError) -> String {
    match &error.path {
        Some(path) => format!("  - {} ({})\n", error.message, path.display()),
        None => format!("  - {}\n", error.message),
    }
}
