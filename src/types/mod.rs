//! Core type definitions for the Leakhound scanner.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Severity level attached to a rule and its detections.
///
/// `Warning` sits below `Low`; rules that declare no severity default to
/// `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Low
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warning" | "warn" => Ok(Severity::Warning),
            "low" => Ok(Severity::Low),
            "medium" | "med" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" | "crit" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Location of a detection within a file. Lines and columns are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
    pub start_column: usize,
    pub end_column: usize,
}

impl Location {
    pub fn new(file: PathBuf, start_line: usize, end_line: usize) -> Self {
        Self {
            file,
            start_line,
            end_line,
            start_column: 1,
            end_column: 1,
        }
    }

    pub fn with_columns(mut self, start: usize, end: usize) -> Self {
        self.start_column = start;
        self.end_column = end;
        self
    }
}

/// A sensitive-data classification attached to detections by classifier
/// rules (Email Address, SSN, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataType {
    pub name: String,
    #[serde(default)]
    pub category_groups: Vec<String>,
    #[serde(default)]
    pub stored: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
}

/// A finalized detection as it appears in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDetection {
    pub rule_id: String,
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    /// The source line containing the match, or the full matched node text
    /// when the rule declares `has_detailed_context`.
    pub parent_content: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_types: Vec<DataType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cwe_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

/// Result of scanning a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub detections: Vec<ReportDetection>,
    pub scan_time_ms: u64,
    /// Set when the file was skipped (cancellation, unsupported parse).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl FileResult {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            detections: Vec::new(),
            scan_time_ms: 0,
            skipped: None,
        }
    }

    pub fn has_detections(&self) -> bool {
        !self.detections.is_empty()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.detections.iter().map(|d| d.severity).max()
    }
}

/// Aggregated report from scanning a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_root: PathBuf,
    pub results: Vec<FileResult>,
    pub total_time_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub rules_version: String,
}

impl ScanReport {
    pub fn new(scan_root: PathBuf, rules_version: String) -> Self {
        Self {
            scan_root,
            results: Vec::new(),
            total_time_ms: 0,
            timestamp: chrono::Utc::now(),
            rules_version,
        }
    }

    pub fn total_detections(&self) -> usize {
        self.results.iter().map(|r| r.detections.len()).sum()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.results.iter().filter_map(|r| r.max_severity()).max()
    }

    pub fn detections_count_by_severity(&self) -> std::collections::BTreeMap<Severity, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for result in &self.results {
            for detection in &result.detections {
                *counts.entry(detection.severity).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Truncate a string to a maximum number of characters (UTF-8 safe).
/// Appends "..." if truncated.
pub fn truncate(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Warning < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_severity_default_is_low() {
        assert_eq!(Severity::default(), Severity::Low);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("WARN".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("bogus".parse::<Severity>().is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer string", 8), "a longer...");
    }
}
