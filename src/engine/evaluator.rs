//! Filter evaluation against a candidate match.
//!
//! Filters never error: a predicate applied to a variable of the wrong
//! shape (a numeric comparison against `sleep(x)`) evaluates to false.
//! A successful evaluation returns the data types propagated from inner
//! detections matched by reference filters.

use crate::pattern::Bindings;
use crate::rules::PatternFilter;
use crate::tree::{string_literal_content, NodeId, SyntaxTree};
use crate::types::DataType;
use std::collections::BTreeMap;

use super::scope::{self, Provenance};
use super::store::DetectionStore;

/// A bound variable with its provenance, which decides `result` scope.
#[derive(Debug, Clone, Copy)]
pub struct EnvEntry {
    pub node: NodeId,
    pub provenance: Provenance,
}

/// Variable environment for one evaluation. Nested reference filters get
/// fresh child environments built from their imports; nothing is global.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: BTreeMap<String, EnvEntry>,
}

impl Env {
    pub fn from_bindings(bindings: &Bindings) -> Self {
        Self {
            vars: bindings
                .iter()
                .map(|(name, &node)| {
                    (
                        name.clone(),
                        EnvEntry {
                            node,
                            provenance: Provenance::Pattern,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn bind(&mut self, name: &str, entry: EnvEntry) {
        self.vars.insert(name.to_string(), entry);
    }

    fn get(&self, name: &str) -> Option<EnvEntry> {
        self.vars.get(name).copied()
    }
}

/// Evaluates filters for one candidate within one file.
pub struct Evaluator<'a> {
    tree: &'a SyntaxTree,
    store: &'a DetectionStore,
    /// File path with forward-slash separators, regardless of host OS.
    filename: String,
}

impl<'a> Evaluator<'a> {
    pub fn new(tree: &'a SyntaxTree, store: &'a DetectionStore, file: &std::path::Path) -> Self {
        let filename = file
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            tree,
            store,
            filename,
        }
    }

    /// Evaluate a conjunction. `None` on the first failing filter; on
    /// success, the union of data types propagated by reference filters.
    pub fn eval_all(&self, filters: &[PatternFilter], env: &Env) -> Option<Vec<DataType>> {
        let mut propagated = Vec::new();
        for filter in filters {
            let data_types = self.eval(filter, env)?;
            merge_data_types(&mut propagated, data_types);
        }
        Some(propagated)
    }

    /// Evaluate one filter. Exhaustive over the filter sum.
    pub fn eval(&self, filter: &PatternFilter, env: &Env) -> Option<Vec<DataType>> {
        match filter {
            PatternFilter::Not(inner) => match self.eval(inner, env) {
                // Data types never propagate out of a negation.
                Some(_) => None,
                None => Some(Vec::new()),
            },

            PatternFilter::Either(subs) => {
                let mut matched = false;
                let mut propagated = Vec::new();
                for sub in subs {
                    if let Some(data_types) = self.eval(sub, env) {
                        matched = true;
                        merge_data_types(&mut propagated, data_types);
                    }
                }
                matched.then_some(propagated)
            }

            PatternFilter::Reference {
                variable,
                detection,
                scope,
                imports,
                filters,
            } => {
                let entry = env.get(variable)?;
                let scope_set =
                    scope::resolve(self.tree, entry.node, *scope, entry.provenance);
                if scope_set.is_empty_set() {
                    return None;
                }

                let mut matched = false;
                let mut propagated = Vec::new();
                for inner in self.store.within(detection, &scope_set) {
                    let mut child_env = Env::default();
                    for import in imports {
                        if let Some(&bound) = inner.bindings.get(&import.alias) {
                            child_env.bind(
                                &import.variable,
                                EnvEntry {
                                    node: bound,
                                    provenance: Provenance::Detection,
                                },
                            );
                        }
                    }
                    if let Some(nested) = self.eval_all(filters, &child_env) {
                        matched = true;
                        merge_data_types(&mut propagated, inner.data_types.clone());
                        merge_data_types(&mut propagated, nested);
                    }
                }
                matched.then_some(propagated)
            }

            PatternFilter::Regex { variable, regex } => {
                let entry = env.get(variable)?;
                regex
                    .is_match(self.tree.text(entry.node))
                    .then_some(Vec::new())
            }

            PatternFilter::StringRegex { variable, regex } => {
                let entry = env.get(variable)?;
                if !self
                    .tree
                    .language()
                    .is_string_literal(self.tree.kind(entry.node))
                {
                    return None;
                }
                let content = string_literal_content(self.tree.text(entry.node));
                regex.is_match(content).then_some(Vec::new())
            }

            PatternFilter::Values { variable, values } => {
                let entry = env.get(variable)?;
                let text = self.comparable_text(entry.node);
                values.iter().any(|v| v == text).then_some(Vec::new())
            }

            PatternFilter::LessThan { variable, value } => {
                self.numeric(env, variable, |n| n < *value)
            }
            PatternFilter::LessThanOrEqual { variable, value } => {
                self.numeric(env, variable, |n| n <= *value)
            }
            PatternFilter::GreaterThan { variable, value } => {
                self.numeric(env, variable, |n| n > *value)
            }
            PatternFilter::GreaterThanOrEqual { variable, value } => {
                self.numeric(env, variable, |n| n >= *value)
            }

            PatternFilter::LengthLessThan { variable, value } => {
                let entry = env.get(variable)?;
                let text = self.comparable_text(entry.node);
                (text.chars().count() < *value).then_some(Vec::new())
            }

            PatternFilter::FilenameRegex { regex } => {
                regex.is_match(&self.filename).then_some(Vec::new())
            }
        }
    }

    /// Literal content for string nodes, raw source text otherwise.
    fn comparable_text(&self, node: NodeId) -> &str {
        let text = self.tree.text(node);
        if self.tree.language().is_string_literal(self.tree.kind(node)) {
            string_literal_content(text)
        } else {
            text
        }
    }

    fn numeric<F: Fn(i64) -> bool>(
        &self,
        env: &Env,
        variable: &str,
        predicate: F,
    ) -> Option<Vec<DataType>> {
        let entry = env.get(variable)?;
        let value: i64 = self.tree.text(entry.node).trim().parse().ok()?;
        predicate(value).then_some(Vec::new())
    }
}

/// Union data types by name, keeping first-seen entries.
pub fn merge_data_types(into: &mut Vec<DataType>, from: Vec<DataType>) {
    for data_type in from {
        if !into.iter().any(|d| d.name == data_type.name) {
            into.push(data_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RawPatternFilter;
    use crate::tree::Language;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn filter(yaml: &str) -> PatternFilter {
        let raw: RawPatternFilter = serde_yaml::from_str(yaml).unwrap();
        raw.compile().unwrap()
    }

    fn env_with(tree: &SyntaxTree, name: &str, text: &str) -> Env {
        let node = tree
            .ids()
            .find(|&id| tree.text(id) == text)
            .unwrap_or_else(|| panic!("no node {:?}", text));
        let mut bindings = Bindings::new();
        bindings.insert(name.to_string(), node);
        Env::from_bindings(&bindings)
    }

    fn empty_store() -> DetectionStore {
        DetectionStore::new(BTreeSet::new())
    }

    #[test]
    fn test_numeric_predicates() {
        let tree = Language::Ruby.parse("sleep(5)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "N", "5");

        assert!(evaluator
            .eval(&filter("variable: N\nless_than: 10"), &env)
            .is_some());
        assert!(evaluator
            .eval(&filter("variable: N\nless_than: 5"), &env)
            .is_none());
        assert!(evaluator
            .eval(&filter("variable: N\nless_than_or_equal: 5"), &env)
            .is_some());
        assert!(evaluator
            .eval(&filter("variable: N\ngreater_than: 4"), &env)
            .is_some());
        assert!(evaluator
            .eval(&filter("variable: N\ngreater_than_or_equal: 6"), &env)
            .is_none());
    }

    #[test]
    fn test_numeric_type_mismatch_is_false() {
        let tree = Language::Ruby.parse("sleep(x)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "N", "x");

        assert!(evaluator
            .eval(&filter("variable: N\nless_than: 10"), &env)
            .is_none());
    }

    #[test]
    fn test_unbound_variable_is_false() {
        let tree = Language::Ruby.parse("sleep(5)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));

        assert!(evaluator
            .eval(&filter("variable: MISSING\nless_than: 10"), &Env::default())
            .is_none());
    }

    #[test]
    fn test_regex_on_node_text() {
        let tree = Language::Ruby.parse("connect(api_key)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "X", "api_key");

        assert!(evaluator
            .eval(&filter("variable: X\nregex: ^api_"), &env)
            .is_some());
        assert!(evaluator
            .eval(&filter("variable: X\nregex: ^secret_"), &env)
            .is_none());
    }

    #[test]
    fn test_string_regex_requires_string_node() {
        let tree = Language::Ruby.parse("open(\"http://x.com\", mode)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));

        let url = env_with(&tree, "U", "\"http://x.com\"");
        assert!(evaluator
            .eval(&filter("variable: U\nstring_regex: ^http://"), &url)
            .is_some());

        // An identifier is not a string literal; string_regex is false.
        let ident = env_with(&tree, "U", "mode");
        assert!(evaluator
            .eval(&filter("variable: U\nstring_regex: .*"), &ident)
            .is_none());
    }

    #[test]
    fn test_values_on_string_content() {
        let tree = Language::Ruby.parse("env(\"production\")\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "E", "\"production\"");

        assert!(evaluator
            .eval(
                &filter("variable: E\nvalues: [production, staging]"),
                &env
            )
            .is_some());
        assert!(evaluator
            .eval(&filter("variable: E\nvalues: [development]"), &env)
            .is_none());
    }

    #[test]
    fn test_length_less_than() {
        let tree = Language::Ruby.parse("check(\"abcd\")\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "S", "\"abcd\"");

        assert!(evaluator
            .eval(&filter("variable: S\nlength_less_than: 5"), &env)
            .is_some());
        assert!(evaluator
            .eval(&filter("variable: S\nlength_less_than: 4"), &env)
            .is_none());
    }

    #[test]
    fn test_filename_regex_uses_forward_slashes() {
        let tree = Language::Ruby.parse("a = 1\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(
            &tree,
            &store,
            Path::new("config").join("environments").join("production.rb").as_path(),
        );

        assert!(evaluator
            .eval(&filter("filename_regex: config/environments/"), &Env::default())
            .is_some());
        assert!(evaluator
            .eval(&filter("filename_regex: spec/"), &Env::default())
            .is_none());
    }

    #[test]
    fn test_not_inverts_and_double_not_is_identity() {
        let tree = Language::Ruby.parse("sleep(5)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "N", "5");

        let base = filter("variable: N\nless_than: 10");
        let negated = PatternFilter::Not(Box::new(base.clone()));
        let double = PatternFilter::Not(Box::new(negated.clone()));

        assert!(evaluator.eval(&base, &env).is_some());
        assert!(evaluator.eval(&negated, &env).is_none());
        assert_eq!(
            evaluator.eval(&double, &env).is_some(),
            evaluator.eval(&base, &env).is_some()
        );
    }

    #[test]
    fn test_either_semantics() {
        let tree = Language::Ruby.parse("sleep(5)\n").unwrap();
        let store = empty_store();
        let evaluator = Evaluator::new(&tree, &store, Path::new("app/main.rb"));
        let env = env_with(&tree, "N", "5");

        let hit = filter("variable: N\nless_than: 10");
        let miss = filter("variable: N\ngreater_than: 10");

        // either([f]) ≡ f
        let single = PatternFilter::Either(vec![hit.clone()]);
        assert_eq!(
            evaluator.eval(&single, &env).is_some(),
            evaluator.eval(&hit, &env).is_some()
        );

        // either([]) ≡ false
        let none = PatternFilter::Either(Vec::new());
        assert!(evaluator.eval(&none, &env).is_none());

        let mixed = PatternFilter::Either(vec![miss.clone(), hit]);
        assert!(evaluator.eval(&mixed, &env).is_some());

        let all_miss = PatternFilter::Either(vec![miss.clone(), miss]);
        assert!(evaluator.eval(&all_miss, &env).is_none());
    }

    #[test]
    fn test_merge_data_types_dedupes_by_name() {
        let email = DataType {
            name: "Email Address".to_string(),
            category_groups: vec!["PII".to_string()],
            stored: false,
            locations: Vec::new(),
        };
        let mut acc = vec![email.clone()];
        merge_data_types(&mut acc, vec![email.clone()]);
        assert_eq!(acc.len(), 1);

        let ssn = DataType {
            name: "SSN".to_string(),
            category_groups: Vec::new(),
            stored: true,
            locations: Vec::new(),
        };
        merge_data_types(&mut acc, vec![ssn]);
        assert_eq!(acc.len(), 2);
    }
}
