//! Output formatters for scan reports.

use crate::types::{ScanReport, Severity};
use anyhow::Result;
use colored::Colorize;
use std::io::Write;

/// Output format for scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Cli,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cli" | "terminal" | "console" => Ok(OutputFormat::Cli),
            "json" => Ok(OutputFormat::Json),
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Write the scan report in the specified format.
pub fn report<W: Write>(report: &ScanReport, format: OutputFormat, writer: &mut W) -> Result<()> {
    match format {
        OutputFormat::Cli => report_cli(report, writer),
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, report)?;
            writeln!(writer)?;
            Ok(())
        }
        OutputFormat::Yaml => {
            serde_yaml::to_writer(&mut *writer, report)?;
            Ok(())
        }
    }
}

fn severity_colored(severity: Severity) -> colored::ColoredString {
    let label = severity.to_string();
    match severity {
        Severity::Critical => label.bright_red().bold(),
        Severity::High => label.red(),
        Severity::Medium => label.yellow(),
        Severity::Low => label.blue(),
        Severity::Warning => label.white().dimmed(),
    }
}

/// CLI-formatted output with colors.
fn report_cli<W: Write>(report: &ScanReport, writer: &mut W) -> Result<()> {
    writeln!(writer)?;
    writeln!(writer, "{}", "Leakhound Security Report".bold().underline())?;
    writeln!(writer)?;
    writeln!(writer, "  Scan root:     {}", report.scan_root.display())?;
    writeln!(writer, "  Files scanned: {}", report.results.len())?;
    writeln!(writer, "  Rules bundle:  {}", report.rules_version)?;
    writeln!(writer, "  Scan time:     {}ms", report.total_time_ms)?;
    writeln!(writer)?;

    let total = report.total_detections();
    if total == 0 {
        writeln!(writer, "{}", "No detections.".green().bold())?;
        return Ok(());
    }

    for result in &report.results {
        if let Some(reason) = &result.skipped {
            writeln!(
                writer,
                "{} {} ({})",
                "skipped".yellow(),
                result.path.display(),
                reason.dimmed()
            )?;
            continue;
        }
        if result.detections.is_empty() {
            continue;
        }

        writeln!(writer, "{}", result.path.display().to_string().bold())?;
        for detection in &result.detections {
            writeln!(
                writer,
                "  {}:{} [{}] {}",
                detection.line,
                detection.column,
                severity_colored(detection.severity),
                detection.rule_id.bright_cyan(),
            )?;
            writeln!(writer, "      {}", detection.parent_content.dimmed())?;
            if !detection.data_types.is_empty() {
                let names: Vec<&str> =
                    detection.data_types.iter().map(|t| t.name.as_str()).collect();
                writeln!(writer, "      data types: {}", names.join(", ").magenta())?;
            }
        }
        writeln!(writer)?;
    }

    let counts = report.detections_count_by_severity();
    let summary: Vec<String> = counts
        .iter()
        .rev()
        .map(|(severity, count)| format!("{} {}", count, severity))
        .collect();
    writeln!(
        writer,
        "{} {} ({})",
        "Total:".bold(),
        total,
        summary.join(", ")
    )?;

    Ok(())
}
