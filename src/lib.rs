//! Leakhound - static code security and privacy scanner.
//!
//! Leakhound parses source files, matches declarative YAML rule patterns
//! against their syntax trees, tracks sensitive data types across rule
//! references, and reports risky flows (loggers, unencrypted transports,
//! third-party sinks).
//!
//! # Quick Start
//!
//! ```no_run
//! use leakhound::{Scanner, ScanConfig};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let scanner = Scanner::new()?;
//!     let report = scanner.scan_path(Path::new("./app"))?;
//!
//!     println!("Found {} detections", report.total_detections());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod pattern;
pub mod reporters;
pub mod rules;
pub mod tree;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use engine::{CancelToken, EngineError, RuleEngine};
pub use reporters::{report, OutputFormat};
pub use rules::loader::{LoadError, LoadOptions, LoadRulesResult};
pub use types::{DataType, FileResult, Location, ReportDetection, ScanReport, Severity};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rules::Policy;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tree::Language;

/// Configuration for the scanner.
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// Force-refresh the external rules cache.
    pub force: bool,
    /// Minimum severity to include in results.
    pub min_severity: Severity,
    /// Filter configuration (skip paths, disabled rules, external rules).
    pub filter_config: Config,
}

/// The main scanner: loaded rules, compiled patterns, and policies.
///
/// Immutable after construction and shareable across worker threads by
/// reference; each `scan_file` call is an independent per-file computation.
pub struct Scanner {
    config: ScanConfig,
    engine: RuleEngine,
    policies: BTreeMap<String, Policy>,
    skip_globs: GlobSet,
    rules_version: String,
    cache_used: bool,
}

impl Scanner {
    /// Create a scanner with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ScanConfig {
            filter_config: Config::load_default(),
            ..Default::default()
        })
    }

    /// Create a scanner with custom configuration.
    pub fn with_config(config: ScanConfig) -> Result<Self> {
        let load_options = LoadOptions {
            external_rule_dir: config.filter_config.external_rule_dir.clone(),
            force: config.force,
            ..Default::default()
        };
        let loaded = rules::loader::load(&load_options).context("failed to load rules")?;
        tracing::info!(
            rules = loaded.rules.len(),
            version = %loaded.rules_version,
            cache_used = loaded.cache_used,
            "rules loaded"
        );

        let policies = rules::loader::default_policies().context("failed to load policies")?;

        let engine = RuleEngine::new(loaded.rules)
            .context("failed to build rule engine")?;

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.filter_config.skip_paths {
            builder.add(Glob::new(pattern).with_context(|| format!("bad glob '{}'", pattern))?);
        }
        let skip_globs = builder.build()?;

        Ok(Self {
            config,
            engine,
            policies,
            skip_globs,
            rules_version: loaded.rules_version,
            cache_used: loaded.cache_used,
        })
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Policies for the external Rego evaluator, modules inlined.
    pub fn policies(&self) -> &BTreeMap<String, Policy> {
        &self.policies
    }

    pub fn rules_version(&self) -> &str {
        &self.rules_version
    }

    pub fn cache_used(&self) -> bool {
        self.cache_used
    }

    /// Scan a file or directory tree.
    pub fn scan_path(&self, path: &Path) -> Result<ScanReport> {
        let start = Instant::now();
        let mut report = ScanReport::new(path.to_path_buf(), self.rules_version.clone());
        let cancel = CancelToken::new();

        for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file = entry.path();

            if self.skip_globs.is_match(file) {
                tracing::debug!(file = %file.display(), "skipping (allowlisted)");
                continue;
            }

            let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("");
            let Some(language) = Language::from_extension(ext) else {
                continue;
            };

            match self.scan_file(file, language, &cancel) {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "failed to scan");
                    let mut result = FileResult::new(file.to_path_buf());
                    result.skipped = Some(e.to_string());
                    report.results.push(result);
                }
            }
        }

        report.total_time_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Scan a single file from disk.
    pub fn scan_file(
        &self,
        file: &Path,
        language: Language,
        cancel: &CancelToken,
    ) -> Result<FileResult> {
        let content = std::fs::read_to_string(file)?;
        self.scan_content(file, &content, language, cancel)
    }

    /// Scan pre-read content.
    pub fn scan_content(
        &self,
        file: &Path,
        content: &str,
        language: Language,
        cancel: &CancelToken,
    ) -> Result<FileResult> {
        let start = Instant::now();
        let mut result = FileResult::new(file.to_path_buf());

        let tree = language
            .parse(content)
            .with_context(|| format!("failed to parse {}", file.display()))?;

        let detections = self.engine.scan(file, &tree, cancel)?;
        result.detections = self.finalize(file, &tree, detections);
        result.scan_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Convert engine detections into report entries, applying severity and
    /// disabled-rule filtering.
    fn finalize(
        &self,
        file: &Path,
        tree: &tree::SyntaxTree,
        detections: Vec<engine::Detection>,
    ) -> Vec<ReportDetection> {
        let disabled = &self.config.filter_config.disabled_rules;

        detections
            .into_iter()
            .filter_map(|d| {
                let rule = self.engine.rule(&d.rule_id)?;
                if disabled.contains(&rule.id) || rule.severity < self.config.min_severity {
                    return None;
                }

                let (line, column) = tree.start_position(d.node);
                let parent_content = if rule.has_detailed_context {
                    tree.text(d.match_node).to_string()
                } else {
                    tree.line_text(line).trim().to_string()
                };

                let mut category_groups: Vec<String> = d
                    .data_types
                    .iter()
                    .flat_map(|t| t.category_groups.iter().cloned())
                    .collect();
                category_groups.sort();
                category_groups.dedup();

                Some(ReportDetection {
                    rule_id: d.rule_id,
                    file: file.to_path_buf(),
                    line,
                    column,
                    parent_content,
                    severity: rule.severity,
                    category_groups,
                    data_types: d.data_types,
                    cwe_ids: rule.cwe_ids.clone(),
                    description: non_empty(&rule.description),
                    remediation_message: non_empty(&rule.remediation_message),
                    documentation_url: non_empty(&rule.documentation_url),
                })
            })
            .collect()
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
