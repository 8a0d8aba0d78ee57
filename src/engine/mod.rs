//! Rule engine driver.
//!
//! A scan is a pure per-file computation: one syntax tree in, one detection
//! list out. Rules are evaluated in topological order over the reference
//! graph so that reference filters only ever look up detections that
//! already exist. Detections are emitted in the stable order
//! `(topo layer, rule id, node pre-order index, pattern index)`.

pub mod evaluator;
pub mod scope;
pub mod store;

use crate::pattern::{self, CompiledPattern};
use crate::rules::graph::{self, EvaluationOrder};
use crate::rules::{MatchOn, Rule, RuleType};
use crate::tree::{Language, NodeId, SyntaxTree};
use crate::types::{DataType, Location};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use evaluator::{merge_data_types, Env, Evaluator};
use scope::ScopeSet;
pub use store::{Detection, DetectionStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scan cancelled")]
    Cancelled,
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Cooperative cancellation flag, checked between rules. Cloneable and
/// shareable with the caller that owns the timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The rule engine: immutable rules, their evaluation order, and compiled
/// patterns per target language. Shareable across scan workers by
/// reference.
pub struct RuleEngine {
    rules: BTreeMap<String, Arc<Rule>>,
    order: EvaluationOrder,
    compiled: HashMap<(String, Language), Vec<CompiledPattern>>,
    compile_warnings: Vec<pattern::CompileError>,
}

impl RuleEngine {
    /// Build an engine from loaded rules, compiling every pattern for every
    /// declared language. A rule whose pattern fails to compile is dropped
    /// from evaluation with a recorded warning; the loader has already
    /// validated the reference graph.
    pub fn new(rules: BTreeMap<String, Arc<Rule>>) -> Result<Self, EngineError> {
        let order = graph::evaluation_order(&rules)
            .map_err(|cycle| EngineError::Internal(format!("reference cycle: {:?}", cycle)))?;

        let mut compiled = HashMap::new();
        let mut compile_warnings = Vec::new();

        for (id, rule) in &rules {
            for tag in &rule.languages {
                let Some(language) = Language::from_tag(tag) else {
                    tracing::debug!(rule = %id, language = %tag, "no grammar for language, skipping");
                    continue;
                };
                let mut patterns = Vec::with_capacity(rule.patterns.len());
                let mut failed = false;
                for (index, rule_pattern) in rule.patterns.iter().enumerate() {
                    match pattern::compile(id, language, rule_pattern, index) {
                        Ok(p) => patterns.push(p),
                        Err(e) => {
                            tracing::warn!(rule = %id, error = %e, "dropping rule: pattern failed to compile");
                            compile_warnings.push(e);
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    compiled.insert((id.clone(), language), patterns);
                }
            }
        }

        Ok(Self {
            rules,
            order,
            compiled,
            compile_warnings,
        })
    }

    pub fn rules(&self) -> &BTreeMap<String, Arc<Rule>> {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Arc<Rule>> {
        self.rules.get(id)
    }

    /// Pattern compile failures recorded while building the engine.
    pub fn compile_warnings(&self) -> &[pattern::CompileError] {
        &self.compile_warnings
    }

    /// Scan one file. Returns finalized top-level detections in stable
    /// order, or `EngineError::Cancelled` with no partial emission.
    pub fn scan(
        &self,
        file: &Path,
        tree: &SyntaxTree,
        cancel: &CancelToken,
    ) -> Result<Vec<Detection>, EngineError> {
        let language = tree.language();
        let applicable: Vec<&Arc<Rule>> = self
            .order
            .ids()
            .iter()
            .filter_map(|id| self.rules.get(id))
            .filter(|rule| rule.applies_to_language(Some(language.tag())))
            .filter(|rule| !rule.dependency_check)
            .collect();

        let known: BTreeSet<String> = self.rules.keys().cloned().collect();
        let mut store = DetectionStore::new(known);

        for rule in &applicable {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.evaluate_rule(rule, file, tree, &mut store)?;
        }

        Ok(self.apply_triggers(&applicable, &store))
    }

    /// Run one rule's patterns over the tree; insert surviving detections.
    fn evaluate_rule(
        &self,
        rule: &Arc<Rule>,
        file: &Path,
        tree: &SyntaxTree,
        store: &mut DetectionStore,
    ) -> Result<(), EngineError> {
        let Some(patterns) = self.compiled.get(&(rule.id.clone(), tree.language())) else {
            return Ok(());
        };

        let mut survivors: Vec<Detection> = Vec::new();

        for compiled in patterns {
            for node in tree.ids() {
                if let Some(kind) = compiled.root_kind() {
                    if tree.kind(node) != kind {
                        continue;
                    }
                }
                let Some(bindings) = compiled.match_at(tree, node) else {
                    continue;
                };

                let env = Env::from_bindings(&bindings);
                let evaluator = Evaluator::new(tree, store, file);
                let filters = rule
                    .patterns
                    .get(compiled.index)
                    .map(|p| p.filters.as_slice())
                    .unwrap_or(&[]);
                let Some(propagated) = evaluator.eval_all(filters, &env) else {
                    continue;
                };

                if let Some(sanitizer_id) = &rule.sanitizer {
                    if sanitizer_suppresses(tree, store, sanitizer_id, node) {
                        tracing::debug!(rule = %rule.id, "candidate suppressed by sanitizer");
                        continue;
                    }
                }

                let focus_node = compiled
                    .focus
                    .as_ref()
                    .and_then(|f| bindings.get(f).copied())
                    .unwrap_or(node);

                let data_types =
                    self.collect_data_types(rule, file, tree, store, node, focus_node, propagated);

                survivors.push(Detection {
                    rule_id: rule.id.clone(),
                    node: focus_node,
                    match_node: node,
                    bindings,
                    data_types,
                    pattern_index: compiled.index,
                });
            }
        }

        // Stable per-rule order: node pre-order index, then pattern index.
        survivors.sort_by_key(|d| (d.node, d.pattern_index));
        for detection in survivors {
            store
                .insert(detection)
                .map_err(EngineError::Internal)?;
        }
        Ok(())
    }

    /// Data types for a candidate: its own classifier declaration, types
    /// propagated through reference filters, and types from classifier
    /// detections (the rule's `detectors`) inside the matched subtree.
    #[allow(clippy::too_many_arguments)]
    fn collect_data_types(
        &self,
        rule: &Arc<Rule>,
        file: &Path,
        tree: &SyntaxTree,
        store: &DetectionStore,
        match_node: NodeId,
        focus_node: NodeId,
        propagated: Vec<DataType>,
    ) -> Vec<DataType> {
        let mut data_types = Vec::new();

        if let Some(def) = &rule.data_type {
            data_types.push(def.to_data_type(node_location(tree, file, focus_node)));
        }

        merge_data_types(&mut data_types, propagated);

        let subtree = ScopeSet::interval(match_node, tree.subtree_end(match_node));
        for classifier_id in &rule.detectors {
            for inner in store.within(classifier_id, &subtree) {
                let mut inner_types = inner.data_types.clone();
                if !rule.auto_encrypt_prefix.is_empty()
                    && tree.text(inner.node).starts_with(&rule.auto_encrypt_prefix)
                {
                    for data_type in &mut inner_types {
                        data_type.stored = false;
                    }
                }
                merge_data_types(&mut data_types, inner_types);
            }
        }

        if !rule.only_data_types.is_empty() {
            data_types.retain(|d| rule.only_data_types.contains(&d.name));
        }
        if !rule.skip_data_types.is_empty() {
            data_types.retain(|d| !rule.skip_data_types.contains(&d.name));
        }

        data_types
    }

    /// Convert per-rule detections into reported ones and filter
    /// auxiliaries. Rules arrive in evaluation order, which is the emission
    /// order.
    fn apply_triggers(&self, applicable: &[&Arc<Rule>], store: &DetectionStore) -> Vec<Detection> {
        let mut reported = Vec::new();

        for rule in applicable {
            // Only top-level risk rules report; auxiliary and shared
            // rules exist to be referenced.
            if rule.auxiliary || rule.rule_type != RuleType::Risk {
                continue;
            }

            let detections: Vec<Detection> =
                store.get(&rule.id).into_iter().cloned().collect();

            match rule.trigger.match_on {
                MatchOn::Presence => {
                    for detection in detections {
                        if rule.trigger.data_types_required && detection.data_types.is_empty() {
                            continue;
                        }
                        reported.push(detection);
                    }
                }
                MatchOn::StoredDataTypes => {
                    for detection in detections {
                        if detection.data_types.iter().any(|d| d.stored) {
                            reported.push(detection);
                        }
                    }
                }
                MatchOn::Absence => {
                    if !detections.is_empty() {
                        continue;
                    }
                    let Some(required) = &rule.trigger.required_detection else {
                        continue;
                    };
                    // Anchor the report at the first detection of the
                    // required rule; without one there is no location.
                    if let Some(anchor) = store.get(required).first() {
                        reported.push(Detection {
                            rule_id: rule.id.clone(),
                            node: anchor.node,
                            match_node: anchor.node,
                            bindings: Default::default(),
                            data_types: Vec::new(),
                            pattern_index: 0,
                        });
                    }
                }
            }
        }

        reported
    }
}

/// A sanitizer detection cancels a candidate when its node dominates the
/// candidate within the nearest enclosing binding scope, or sits inside the
/// candidate's own subtree.
fn sanitizer_suppresses(
    tree: &SyntaxTree,
    store: &DetectionStore,
    sanitizer_id: &str,
    candidate: NodeId,
) -> bool {
    let sanitizers = store.get(sanitizer_id);
    if sanitizers.is_empty() {
        return false;
    }

    if sanitizers
        .iter()
        .any(|d| tree.contains(candidate, d.node))
    {
        return true;
    }

    let language = tree.language();
    let mut current = tree.parent(candidate);
    while let Some(node) = current {
        if sanitizers.iter().any(|d| d.node == node) {
            return true;
        }
        if language.is_binding_boundary(tree.kind(node)) {
            break;
        }
        current = tree.parent(node);
    }
    false
}

/// 1-indexed source location of a node.
pub fn node_location(tree: &SyntaxTree, file: &Path, node: NodeId) -> Location {
    let (start_line, start_column) = tree.start_position(node);
    let (end_line, end_column) = tree.end_position(node);
    Location::new(file.to_path_buf(), start_line, end_line)
        .with_columns(start_column, end_column)
}
