//! Rule data model for the scanner.
//!
//! Rule files are YAML (see `rules/` for the built-in bundle). The raw
//! serde-facing shapes (`RuleDefinition`, `RawPatternFilter`) mirror the
//! file format including its shorthand forms; [`RuleDefinition::materialize`]
//! turns a parsed file into immutable [`Rule`] values with validated,
//! regex-compiled [`PatternFilter`] trees.

pub mod graph;
pub mod loader;

use crate::types::{DataType, Location, Severity};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;

/// How a rule's collected detections convert into reported ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchOn {
    #[default]
    Presence,
    Absence,
    StoredDataTypes,
}

/// Scope of a reference filter lookup, relating a variable's node to
/// candidate inner detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceScope {
    CursorStrict,
    Cursor,
    #[default]
    Nested,
    NestedStrict,
    Result,
}

/// Rule classification. `Shared` rules exist to be referenced; `Verifier`
/// rules gate other detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    #[default]
    Risk,
    Verifier,
    Shared,
}

/// Fully-resolved trigger attached to a materialized rule.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleTrigger {
    pub match_on: MatchOn,
    pub data_types_required: bool,
    pub required_detection: Option<String>,
}

/// Trigger as written in a rule file: every field optional, merged over the
/// defaults field-wise.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinitionTrigger {
    pub match_on: Option<MatchOn>,
    pub data_types_required: Option<bool>,
    pub required_detection: Option<String>,
}

impl RuleDefinitionTrigger {
    /// Merge this definition over `base`, field-wise. Definition fields win
    /// only where present.
    pub fn merge_into(&self, base: RuleTrigger) -> RuleTrigger {
        RuleTrigger {
            match_on: self.match_on.unwrap_or(base.match_on),
            data_types_required: self.data_types_required.unwrap_or(base.data_types_required),
            required_detection: self
                .required_detection
                .clone()
                .or(base.required_detection),
        }
    }
}

/// Renames an inner detection's binding into a nested filter environment.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImportBinding {
    pub variable: String,
    #[serde(rename = "as")]
    pub alias: String,
}

/// Package dependency constraint for `dependency_check` rules.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    pub filename: String,
    pub name: String,
    pub min_version: String,
}

impl Dependency {
    /// Whether `found` falls below the minimum version. Versions compare as
    /// dotted numeric segments; a non-numeric segment ends the comparison.
    pub fn version_below_minimum(&self, found: &str) -> bool {
        version_segments(found) < version_segments(&self.min_version)
    }
}

pub(crate) fn version_segments(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map_while(|part| part.parse::<u64>().ok())
        .collect()
}

/// Sensitive-data classification declared by a classifier rule.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DataTypeDef {
    pub name: String,
    #[serde(default)]
    pub category_groups: Vec<String>,
    #[serde(default)]
    pub stored: bool,
}

impl DataTypeDef {
    pub fn to_data_type(&self, location: Location) -> DataType {
        DataType {
            name: self.name.clone(),
            category_groups: self.category_groups.clone(),
            stored: self.stored,
            locations: vec![location],
        }
    }
}

/// Descriptive rule metadata. `id` doubles as the rule's identity.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleMetadata {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub remediation_message: String,
    #[serde(default, rename = "cwe_id")]
    pub cwe_ids: Vec<String>,
    #[serde(default)]
    pub associated_recipe: String,
    #[serde(default)]
    pub documentation_url: String,
}

/// A filter as evaluated by the engine: a tagged sum, matched exhaustively.
#[derive(Debug, Clone)]
pub enum PatternFilter {
    Not(Box<PatternFilter>),
    Either(Vec<PatternFilter>),
    Reference {
        variable: String,
        detection: String,
        scope: ReferenceScope,
        imports: Vec<ImportBinding>,
        filters: Vec<PatternFilter>,
    },
    Regex {
        variable: String,
        regex: Regex,
    },
    StringRegex {
        variable: String,
        regex: Regex,
    },
    Values {
        variable: String,
        values: Vec<String>,
    },
    LessThan {
        variable: String,
        value: i64,
    },
    LessThanOrEqual {
        variable: String,
        value: i64,
    },
    GreaterThan {
        variable: String,
        value: i64,
    },
    GreaterThanOrEqual {
        variable: String,
        value: i64,
    },
    LengthLessThan {
        variable: String,
        value: usize,
    },
    FilenameRegex {
        regex: Regex,
    },
}

impl PatternFilter {
    /// Rule ids this filter (transitively) references.
    pub fn referenced_ids(&self, out: &mut BTreeSet<String>) {
        match self {
            PatternFilter::Not(inner) => inner.referenced_ids(out),
            PatternFilter::Either(subs) => {
                for sub in subs {
                    sub.referenced_ids(out);
                }
            }
            PatternFilter::Reference {
                detection, filters, ..
            } => {
                out.insert(detection.clone());
                for sub in filters {
                    sub.referenced_ids(out);
                }
            }
            _ => {}
        }
    }
}

/// Filter as written in YAML: the flat legacy shape with every key optional.
/// Validated into [`PatternFilter`] by [`RawPatternFilter::compile`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawPatternFilter {
    pub not: Option<Box<RawPatternFilter>>,
    #[serde(default)]
    pub either: Vec<RawPatternFilter>,
    pub variable: Option<String>,
    pub detection: Option<String>,
    pub scope: Option<ReferenceScope>,
    #[serde(default)]
    pub filters: Vec<RawPatternFilter>,
    #[serde(default)]
    pub imports: Vec<ImportBinding>,
    /// Deprecated in favour of `scope`: `contains: false` means `cursor`,
    /// true or absent means `nested`.
    pub contains: Option<bool>,
    pub regex: Option<String>,
    pub string_regex: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
    pub length_less_than: Option<usize>,
    pub less_than: Option<i64>,
    pub less_than_or_equal: Option<i64>,
    pub greater_than: Option<i64>,
    pub greater_than_or_equal: Option<i64>,
    pub filename_regex: Option<String>,
}

impl RawPatternFilter {
    /// Validate and compile into the tagged sum. Exactly one filter form
    /// must be present; regexes compile here so evaluation never errors.
    pub fn compile(&self) -> Result<PatternFilter, String> {
        if let Some(inner) = &self.not {
            return Ok(PatternFilter::Not(Box::new(inner.compile()?)));
        }

        if !self.either.is_empty() {
            let subs = self
                .either
                .iter()
                .map(|f| f.compile())
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PatternFilter::Either(subs));
        }

        if let Some(detection) = &self.detection {
            let variable = self
                .variable
                .clone()
                .ok_or_else(|| format!("reference to '{}' requires a variable", detection))?;
            let scope = match (self.scope, self.contains) {
                (Some(scope), _) => scope,
                (None, Some(false)) => ReferenceScope::Cursor,
                (None, _) => ReferenceScope::Nested,
            };
            let filters = self
                .filters
                .iter()
                .map(|f| f.compile())
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PatternFilter::Reference {
                variable,
                detection: detection.clone(),
                scope,
                imports: self.imports.clone(),
                filters,
            });
        }

        if let Some(pattern) = &self.filename_regex {
            let regex = compile_regex(pattern)?;
            return Ok(PatternFilter::FilenameRegex { regex });
        }

        let variable = self
            .variable
            .clone()
            .ok_or_else(|| "filter has no variable and no filename_regex".to_string())?;

        let mut compiled: Vec<PatternFilter> = Vec::new();
        if let Some(pattern) = &self.regex {
            compiled.push(PatternFilter::Regex {
                variable: variable.clone(),
                regex: compile_regex(pattern)?,
            });
        }
        if let Some(pattern) = &self.string_regex {
            compiled.push(PatternFilter::StringRegex {
                variable: variable.clone(),
                regex: compile_regex(pattern)?,
            });
        }
        if !self.values.is_empty() {
            compiled.push(PatternFilter::Values {
                variable: variable.clone(),
                values: self.values.clone(),
            });
        }
        if let Some(value) = self.less_than {
            compiled.push(PatternFilter::LessThan {
                variable: variable.clone(),
                value,
            });
        }
        if let Some(value) = self.less_than_or_equal {
            compiled.push(PatternFilter::LessThanOrEqual {
                variable: variable.clone(),
                value,
            });
        }
        if let Some(value) = self.greater_than {
            compiled.push(PatternFilter::GreaterThan {
                variable: variable.clone(),
                value,
            });
        }
        if let Some(value) = self.greater_than_or_equal {
            compiled.push(PatternFilter::GreaterThanOrEqual {
                variable: variable.clone(),
                value,
            });
        }
        if let Some(value) = self.length_less_than {
            compiled.push(PatternFilter::LengthLessThan {
                variable: variable.clone(),
                value,
            });
        }

        match compiled.len() {
            0 => Err(format!("filter on '{}' has no predicate", variable)),
            1 => Ok(compiled.into_iter().next().unwrap()),
            _ => Err(format!(
                "filter on '{}' mixes multiple predicates",
                variable
            )),
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid regex '{}': {}", pattern, e))
}

/// A pattern as written in YAML: bare string shorthand or structured form.
#[derive(Debug, Clone)]
pub struct RawRulePattern {
    pub pattern: String,
    pub focus: Option<String>,
    pub filters: Vec<RawPatternFilter>,
}

impl<'de> Deserialize<'de> for RawRulePattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Structured {
            pattern: String,
            focus: Option<String>,
            #[serde(default)]
            filters: Vec<RawPatternFilter>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Form {
            Shorthand(String),
            Structured(Structured),
        }

        match Form::deserialize(deserializer)? {
            Form::Shorthand(pattern) => Ok(RawRulePattern {
                pattern,
                focus: None,
                filters: Vec::new(),
            }),
            Form::Structured(s) => Ok(RawRulePattern {
                pattern: s.pattern,
                focus: s.focus,
                filters: s.filters,
            }),
        }
    }
}

/// A materialized pattern: source fragment, focus metavariable, compiled
/// filters.
#[derive(Debug, Clone)]
pub struct RulePattern {
    pub pattern: String,
    pub focus: Option<String>,
    pub filters: Vec<PatternFilter>,
}

/// An auxiliary rule defined inline in a rule file. Addressable by other
/// rules via references, never reported.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuxiliaryDefinition {
    pub id: String,
    #[serde(default)]
    pub patterns: Vec<RawRulePattern>,
    #[serde(default)]
    pub sanitizer: Option<String>,
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub auto_encrypt_prefix: String,
    #[serde(default)]
    pub detect_presence: bool,
    #[serde(default)]
    pub data_type: Option<DataTypeDef>,
}

/// A rule file as parsed from YAML. One file defines one rule plus any
/// inline auxiliaries.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<RawRulePattern>,
    #[serde(default)]
    pub sanitizer: Option<String>,
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub auto_encrypt_prefix: String,
    #[serde(default)]
    pub detect_presence: bool,
    #[serde(default)]
    pub trigger: Option<RuleDefinitionTrigger>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub skip_data_types: Vec<String>,
    #[serde(default)]
    pub only_data_types: Vec<String>,
    #[serde(default)]
    pub has_detailed_context: bool,
    pub metadata: RuleMetadata,
    #[serde(default)]
    pub auxiliary: Vec<AuxiliaryDefinition>,
    #[serde(default)]
    pub dependency_check: bool,
    #[serde(default)]
    pub dependency: Option<Dependency>,
    #[serde(default)]
    pub data_type: Option<DataTypeDef>,
}

impl RuleDefinition {
    /// Materialize the file into rules: the main rule followed by its
    /// auxiliaries. Filter validation and regex compilation happen here.
    pub fn materialize(&self) -> Result<Vec<Rule>, String> {
        if self.metadata.id.is_empty() {
            return Err("rule has no metadata.id".to_string());
        }

        let trigger = self
            .trigger
            .as_ref()
            .map(|t| t.merge_into(RuleTrigger::default()))
            .unwrap_or_default();

        let mut rules = vec![Rule {
            id: self.metadata.id.clone(),
            rule_type: self.rule_type,
            languages: self.languages.clone(),
            patterns: materialize_patterns(&self.patterns)?,
            auxiliary: false,
            severity: self.severity.unwrap_or_default(),
            description: self.metadata.description.clone(),
            remediation_message: self.metadata.remediation_message.clone(),
            cwe_ids: self.metadata.cwe_ids.clone(),
            associated_recipe: self.metadata.associated_recipe.clone(),
            documentation_url: self.metadata.documentation_url.clone(),
            trigger,
            stored: self.stored,
            detect_presence: self.detect_presence,
            auto_encrypt_prefix: self.auto_encrypt_prefix.clone(),
            skip_data_types: self.skip_data_types.clone(),
            only_data_types: self.only_data_types.clone(),
            has_detailed_context: self.has_detailed_context,
            sanitizer: self.sanitizer.clone(),
            dependency_check: self.dependency_check,
            dependency: self.dependency.clone(),
            detectors: self.detectors.clone(),
            imports: self.imports.clone(),
            data_type: self.data_type.clone(),
        }];

        for aux in &self.auxiliary {
            rules.push(Rule {
                id: aux.id.clone(),
                rule_type: RuleType::Shared,
                languages: self.languages.clone(),
                patterns: materialize_patterns(&aux.patterns)?,
                auxiliary: true,
                severity: Severity::default(),
                description: String::new(),
                remediation_message: String::new(),
                cwe_ids: Vec::new(),
                associated_recipe: String::new(),
                documentation_url: String::new(),
                trigger: RuleTrigger::default(),
                stored: aux.stored,
                detect_presence: aux.detect_presence,
                auto_encrypt_prefix: aux.auto_encrypt_prefix.clone(),
                skip_data_types: Vec::new(),
                only_data_types: Vec::new(),
                has_detailed_context: false,
                sanitizer: aux.sanitizer.clone(),
                dependency_check: false,
                dependency: None,
                detectors: aux.detectors.clone(),
                imports: Vec::new(),
                data_type: aux.data_type.clone(),
            });
        }

        Ok(rules)
    }
}

fn materialize_patterns(raw: &[RawRulePattern]) -> Result<Vec<RulePattern>, String> {
    raw.iter()
        .map(|p| {
            Ok(RulePattern {
                pattern: p.pattern.clone(),
                focus: p.focus.clone(),
                filters: p
                    .filters
                    .iter()
                    .map(|f| f.compile())
                    .collect::<Result<Vec<_>, String>>()?,
            })
        })
        .collect()
}

/// An immutable, fully-validated rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub rule_type: RuleType,
    /// Language tags this rule applies to. Empty means the designated
    /// secrets/text pseudo-file, never a parsed source file.
    pub languages: Vec<String>,
    pub patterns: Vec<RulePattern>,
    pub auxiliary: bool,
    pub severity: Severity,
    pub description: String,
    pub remediation_message: String,
    pub cwe_ids: Vec<String>,
    pub associated_recipe: String,
    pub documentation_url: String,
    pub trigger: RuleTrigger,
    pub stored: bool,
    pub detect_presence: bool,
    pub auto_encrypt_prefix: String,
    pub skip_data_types: Vec<String>,
    pub only_data_types: Vec<String>,
    pub has_detailed_context: bool,
    pub sanitizer: Option<String>,
    pub dependency_check: bool,
    pub dependency: Option<Dependency>,
    /// Classifier rule ids whose detections supply data types.
    pub detectors: Vec<String>,
    /// Rules that must be evaluated before this one.
    pub imports: Vec<String>,
    /// Present on classifier rules only.
    pub data_type: Option<DataTypeDef>,
}

impl Rule {
    /// Whether this rule runs against a file of the given language.
    /// `None` designates the secrets/text pseudo-file.
    pub fn applies_to_language(&self, language: Option<&str>) -> bool {
        match language {
            None => self.languages.is_empty(),
            Some(tag) => self.languages.iter().any(|l| l == tag),
        }
    }

    /// Rules with a declared data type classify content they match.
    pub fn is_classifier(&self) -> bool {
        self.data_type.is_some()
    }

    /// Every rule id this rule depends on: reference filters, sanitizer,
    /// required detection, detectors, and explicit imports.
    pub fn referenced_rule_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for pattern in &self.patterns {
            for filter in &pattern.filters {
                filter.referenced_ids(&mut ids);
            }
        }
        if let Some(sanitizer) = &self.sanitizer {
            ids.insert(sanitizer.clone());
        }
        if let Some(required) = &self.trigger.required_detection {
            ids.insert(required.clone());
        }
        for detector in &self.detectors {
            ids.insert(detector.clone());
        }
        for import in &self.imports {
            ids.insert(import.clone());
        }
        ids.remove(&self.id);
        ids
    }
}

/// Policy consumed by the external Rego evaluator.
#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    #[serde(rename = "type")]
    pub policy_type: String,
    pub query: String,
    #[serde(default)]
    pub modules: Vec<PolicyModule>,
}

/// A Rego module attached to a policy. Modules carrying a `path` have their
/// embedded file inlined into `content` at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyModule {
    #[serde(default)]
    pub path: Option<String>,
    pub name: String,
    #[serde(default)]
    pub content: String,
}

/// Module form handed to the policy evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct RegoModule {
    pub name: String,
    pub content: String,
}

pub fn to_rego_modules(modules: &[PolicyModule]) -> Vec<RegoModule> {
    modules
        .iter()
        .map(|m| RegoModule {
            name: m.name.clone(),
            content: m.content.clone(),
        })
        .collect()
}
