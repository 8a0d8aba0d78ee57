//! Rule loading: embedded built-ins, external directories, validation.
//!
//! Built-in rules, policies, and Rego processor modules are compiled into
//! the binary. An external rules directory may add rules or override
//! built-ins by id; its file bundle is cached under the user cache dir so
//! later runs skip the directory walk unless `force` is set.
//!
//! All structural validation happens here: duplicate ids, unresolved
//! references, reference cycles, and bundle/engine version compatibility
//! are load-time failures that block startup.

use super::graph;
use super::{Policy, Rule, RuleDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse rule file {0}: {1}")]
    Parse(PathBuf, String),
    #[error("duplicate rule id '{0}'")]
    Duplicate(String),
    #[error("rule '{rule}' references unknown rule '{target}'")]
    UnresolvedReference { rule: String, target: String },
    #[error("reference cycle between rules: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("missing embedded module '{0}'")]
    MissingModule(String),
    #[error("rules bundle requires engine version {required}, have {have}")]
    VersionMismatch { required: String, have: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Embedded rules-bundle manifest.
const BUILTIN_MANIFEST: &str = include_str!("../../rules/manifest.yml");

/// Built-in rule files, organized by language (compiled into the binary).
const BUILTIN_RULES: &[(&str, &str)] = &[
    (
        "ruby/classifiers/email.yml",
        include_str!("../../rules/ruby/classifiers/email.yml"),
    ),
    (
        "ruby/classifiers/password.yml",
        include_str!("../../rules/ruby/classifiers/password.yml"),
    ),
    (
        "ruby/lang/logger_leak.yml",
        include_str!("../../rules/ruby/lang/logger_leak.yml"),
    ),
    (
        "ruby/lang/insecure_http.yml",
        include_str!("../../rules/ruby/lang/insecure_http.yml"),
    ),
    (
        "ruby/lang/busy_sleep.yml",
        include_str!("../../rules/ruby/lang/busy_sleep.yml"),
    ),
    (
        "javascript/lang/console_leak.yml",
        include_str!("../../rules/javascript/lang/console_leak.yml"),
    ),
];

/// Embedded policy descriptors and Rego modules.
const BUILTIN_POLICIES: &str = include_str!("../../policies.yml");

const POLICY_MODULES: &[(&str, &str)] = &[
    (
        "policies/risks.rego",
        include_str!("../../policies/risks.rego"),
    ),
    (
        "policies/shared.rego",
        include_str!("../../policies/shared.rego"),
    ),
];

const PROCESSOR_MODULES: &[(&str, &str)] = &[(
    "processors/detection_grouping.rego",
    include_str!("../../processors/detection_grouping.rego"),
)];

#[derive(Debug, Deserialize)]
struct Manifest {
    version: String,
    minimum_engine_version: String,
}

/// Inputs to [`load`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Directory of additional rule files. Rules here override built-ins of
    /// the same id.
    pub external_rule_dir: Option<PathBuf>,
    /// Bypass and rewrite the external bundle cache.
    pub force: bool,
    /// Version of the running engine, checked against the bundle manifest.
    pub engine_version: String,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            external_rule_dir: None,
            force: false,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Output of [`load`].
#[derive(Debug)]
pub struct LoadRulesResult {
    /// All loaded rules, external overriding built-in by id.
    pub rules: BTreeMap<String, Arc<Rule>>,
    pub built_in_rules: BTreeMap<String, Arc<Rule>>,
    pub cache_used: bool,
    pub rules_version: String,
}

/// Load and validate the full rule set.
pub fn load(options: &LoadOptions) -> Result<LoadRulesResult, LoadError> {
    let manifest: Manifest = serde_yaml::from_str(BUILTIN_MANIFEST)
        .map_err(|e| LoadError::Parse(PathBuf::from("rules/manifest.yml"), e.to_string()))?;

    if super::version_segments(&options.engine_version)
        < super::version_segments(&manifest.minimum_engine_version)
    {
        return Err(LoadError::VersionMismatch {
            required: manifest.minimum_engine_version,
            have: options.engine_version.clone(),
        });
    }

    let mut built_in_rules: BTreeMap<String, Arc<Rule>> = BTreeMap::new();
    for (path, content) in BUILTIN_RULES {
        for rule in parse_rule_file(Path::new(path), content)? {
            let rule = Arc::new(rule);
            if built_in_rules.insert(rule.id.clone(), rule.clone()).is_some() {
                return Err(LoadError::Duplicate(rule.id.clone()));
            }
        }
    }
    tracing::debug!(count = built_in_rules.len(), "loaded built-in rules");

    let mut rules = built_in_rules.clone();
    let mut cache_used = false;

    if let Some(dir) = &options.external_rule_dir {
        let (files, from_cache) = external_bundle(dir, options.force)?;
        cache_used = from_cache;

        let mut external_ids: Vec<String> = Vec::new();
        for (path, content) in &files {
            for rule in parse_rule_file(path, content)? {
                // External may override a built-in of the same id, but two
                // externals with one id is an authoring error.
                if external_ids.contains(&rule.id) {
                    return Err(LoadError::Duplicate(rule.id.clone()));
                }
                external_ids.push(rule.id.clone());
                rules.insert(rule.id.clone(), Arc::new(rule));
            }
        }
        tracing::info!(
            count = external_ids.len(),
            cache_used,
            "loaded external rules"
        );
    }

    // Every referenced id must resolve to a loaded rule.
    for rule in rules.values() {
        for target in rule.referenced_rule_ids() {
            if !rules.contains_key(&target) {
                return Err(LoadError::UnresolvedReference {
                    rule: rule.id.clone(),
                    target,
                });
            }
        }
    }

    // The reference graph must be acyclic; evaluation order is recomputed
    // cheaply by the engine from the same graph.
    graph::evaluation_order(&rules).map_err(LoadError::Cycle)?;

    Ok(LoadRulesResult {
        rules,
        built_in_rules,
        cache_used,
        rules_version: manifest.version,
    })
}

/// Parse one rule file into materialized rules (main rule + auxiliaries).
/// A disabled file contributes nothing.
pub fn parse_rule_file(path: &Path, content: &str) -> Result<Vec<Rule>, LoadError> {
    let definition: RuleDefinition = serde_yaml::from_str(content)
        .map_err(|e| LoadError::Parse(path.to_path_buf(), e.to_string()))?;

    if definition.disabled {
        tracing::debug!(path = %path.display(), "skipping disabled rule");
        return Ok(Vec::new());
    }

    definition
        .materialize()
        .map_err(|e| LoadError::Parse(path.to_path_buf(), e))
}

#[derive(Serialize, Deserialize)]
struct CachedBundle {
    engine_version: String,
    files: Vec<CachedFile>,
}

#[derive(Serialize, Deserialize)]
struct CachedFile {
    path: PathBuf,
    content: String,
}

/// Read the external rule files, from the bundle cache when possible.
/// Returns the files plus whether the cache satisfied the read.
fn external_bundle(dir: &Path, force: bool) -> Result<(Vec<(PathBuf, String)>, bool), LoadError> {
    let cache_path = bundle_cache_path(dir);

    if !force {
        if let Some(path) = &cache_path {
            if let Some(bundle) = read_cached_bundle(path) {
                return Ok((
                    bundle.files.into_iter().map(|f| (f.path, f.content)).collect(),
                    true,
                ));
            }
        }
    }

    let mut files: Vec<(PathBuf, String)> = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| LoadError::Parse(dir.to_path_buf(), e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => {
                let content = std::fs::read_to_string(path)?;
                files.push((path.to_path_buf(), content));
            }
            _ => {}
        }
    }

    if let Some(path) = &cache_path {
        if let Err(e) = write_cached_bundle(path, &files) {
            tracing::warn!(error = %e, "failed to write rules cache");
        }
    }

    Ok((files, false))
}

fn bundle_cache_path(dir: &Path) -> Option<PathBuf> {
    let cache_root = dirs::cache_dir()?.join("leakhound").join("rules");
    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    hasher.update(dir.to_string_lossy().as_bytes());
    Some(cache_root.join(format!("{:x}.json", hasher.finalize())))
}

fn read_cached_bundle(path: &Path) -> Option<CachedBundle> {
    let data = std::fs::read_to_string(path).ok()?;
    let bundle: CachedBundle = serde_json::from_str(&data).ok()?;
    if bundle.engine_version != env!("CARGO_PKG_VERSION") {
        return None;
    }
    Some(bundle)
}

/// Atomic write (tmp + rename), so a concurrent scan never sees a torn
/// bundle.
fn write_cached_bundle(path: &Path, files: &[(PathBuf, String)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bundle = CachedBundle {
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        files: files
            .iter()
            .map(|(path, content)| CachedFile {
                path: path.clone(),
                content: content.clone(),
            })
            .collect(),
    };
    let json = serde_json::to_string(&bundle).expect("bundle serializes");
    let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Default policies with their Rego modules inlined from the embedded
/// files. A module `path` that resolves to nothing is a packaging error.
pub fn default_policies() -> Result<BTreeMap<String, Policy>, LoadError> {
    let policies: Vec<Policy> = serde_yaml::from_str(BUILTIN_POLICIES)
        .map_err(|e| LoadError::Parse(PathBuf::from("policies.yml"), e.to_string()))?;

    let mut by_type = BTreeMap::new();
    for mut policy in policies {
        for module in &mut policy.modules {
            if let Some(path) = &module.path {
                let content = POLICY_MODULES
                    .iter()
                    .find(|(p, _)| *p == path.as_str())
                    .map(|(_, content)| *content)
                    .ok_or_else(|| LoadError::MissingModule(path.clone()))?;
                module.content = content.to_string();
            }
        }
        by_type.insert(policy.policy_type.clone(), policy);
    }
    Ok(by_type)
}

/// Embedded Rego text for a named processor.
pub fn processor_module_text(name: &str) -> Result<String, LoadError> {
    let path = format!("processors/{}.rego", name);
    PROCESSOR_MODULES
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, content)| content.to_string())
        .ok_or(LoadError::MissingModule(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rule(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_builtin_rules_load() {
        let result = load(&LoadOptions::default()).unwrap();
        assert!(!result.rules.is_empty());
        assert!(!result.cache_used);
        assert!(!result.rules_version.is_empty());
        assert_eq!(result.built_in_rules.len(), result.rules.len());
        // Classifier and risk rules both present.
        assert!(result.rules.values().any(|r| r.is_classifier()));
        assert!(result.rules.values().any(|r| !r.auxiliary));
    }

    #[test]
    fn test_version_mismatch_blocks_load() {
        let options = LoadOptions {
            engine_version: "0.0.1".to_string(),
            ..Default::default()
        };
        let err = load(&options).unwrap_err();
        assert!(matches!(err, LoadError::VersionMismatch { .. }));
    }

    #[test]
    fn test_external_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "override.yml",
            r#"
type: risk
languages: [ruby]
severity: critical
patterns:
  - logger.info($<X>)
metadata:
  id: ruby_lang_logger_leak
  description: overridden
"#,
        );

        let options = LoadOptions {
            external_rule_dir: Some(dir.path().to_path_buf()),
            force: true,
            ..Default::default()
        };
        let result = load(&options).unwrap();
        let rule = &result.rules["ruby_lang_logger_leak"];
        assert_eq!(rule.description, "overridden");
        // The built-in copy is untouched.
        assert_ne!(
            result.built_in_rules["ruby_lang_logger_leak"].description,
            "overridden"
        );
    }

    #[test]
    fn test_external_duplicate_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let rule = r#"
type: risk
languages: [ruby]
patterns: ["foo($<X>)"]
metadata:
  id: dup_rule
"#;
        write_rule(dir.path(), "a.yml", rule);
        write_rule(dir.path(), "b.yml", rule);

        let options = LoadOptions {
            external_rule_dir: Some(dir.path().to_path_buf()),
            force: true,
            ..Default::default()
        };
        match load(&options).unwrap_err() {
            LoadError::Duplicate(id) => assert_eq!(id, "dup_rule"),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_reference_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "dangling.yml",
            r#"
type: risk
languages: [ruby]
patterns:
  - pattern: foo($<X>)
    filters:
      - variable: X
        detection: no_such_rule
metadata:
  id: dangling_rule
"#,
        );

        let options = LoadOptions {
            external_rule_dir: Some(dir.path().to_path_buf()),
            force: true,
            ..Default::default()
        };
        match load(&options).unwrap_err() {
            LoadError::UnresolvedReference { rule, target } => {
                assert_eq!(rule, "dangling_rule");
                assert_eq!(target, "no_such_rule");
            }
            other => panic!("expected unresolved reference, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_cycle_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "rule_a.yml",
            r#"
type: risk
languages: [ruby]
imports: [cycle_rule_b]
patterns: ["foo($<X>)"]
metadata:
  id: cycle_rule_a
"#,
        );
        write_rule(
            dir.path(),
            "rule_b.yml",
            r#"
type: risk
languages: [ruby]
imports: [cycle_rule_a]
patterns: ["bar($<X>)"]
metadata:
  id: cycle_rule_b
"#,
        );

        let options = LoadOptions {
            external_rule_dir: Some(dir.path().to_path_buf()),
            force: true,
            ..Default::default()
        };
        match load(&options).unwrap_err() {
            LoadError::Cycle(ids) => {
                assert!(ids.contains(&"cycle_rule_a".to_string()));
                assert!(ids.contains(&"cycle_rule_b".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "broken.yml", "patterns: [unclosed\n");

        let options = LoadOptions {
            external_rule_dir: Some(dir.path().to_path_buf()),
            force: true,
            ..Default::default()
        };
        assert!(matches!(
            load(&options).unwrap_err(),
            LoadError::Parse(_, _)
        ));
    }

    #[test]
    fn test_default_policies_expand_modules() {
        let policies = default_policies().unwrap();
        assert!(!policies.is_empty());
        for policy in policies.values() {
            for module in &policy.modules {
                if module.path.is_some() {
                    assert!(!module.content.is_empty(), "module {} not inlined", module.name);
                }
            }
        }
    }

    #[test]
    fn test_processor_module_text() {
        assert!(processor_module_text("detection_grouping").is_ok());
        assert!(matches!(
            processor_module_text("nonexistent"),
            Err(LoadError::MissingModule(_))
        ));
    }
}
