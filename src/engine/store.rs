//! Per-file detection store.
//!
//! Append-only for the duration of one file scan. Detections are keyed by
//! `(rule_id, node)`; the secondary pre-order interval index lets reference
//! filters answer "which detections of rule R sit inside this subtree"
//! without re-matching.

use crate::pattern::Bindings;
use crate::tree::NodeId;
use crate::types::DataType;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::scope::ScopeSet;

/// A detection as held by the engine during a file scan.
#[derive(Debug, Clone)]
pub struct Detection {
    pub rule_id: String,
    /// Reported node: the pattern's focus metavariable, or the match root.
    pub node: NodeId,
    /// The node the pattern matched, before focus narrowing.
    pub match_node: NodeId,
    pub bindings: Bindings,
    pub data_types: Vec<DataType>,
    pub pattern_index: usize,
}

/// Store of detections for one file. Not shared across files.
#[derive(Debug, Default)]
pub struct DetectionStore {
    detections: Vec<Detection>,
    by_rule: BTreeMap<String, Vec<usize>>,
    seen: HashSet<(String, NodeId)>,
    known_rules: BTreeSet<String>,
}

impl DetectionStore {
    pub fn new(known_rules: BTreeSet<String>) -> Self {
        Self {
            known_rules,
            ..Default::default()
        }
    }

    /// Insert a detection. Idempotent on `(rule_id, node)`: the first
    /// insertion wins. An unknown rule id is an engine bug, reported as
    /// an invariant violation.
    pub fn insert(&mut self, detection: Detection) -> Result<(), String> {
        if !self.known_rules.contains(&detection.rule_id) {
            return Err(format!(
                "detection store received unknown rule id '{}'",
                detection.rule_id
            ));
        }
        let key = (detection.rule_id.clone(), detection.node);
        if !self.seen.insert(key) {
            return Ok(());
        }
        self.by_rule
            .entry(detection.rule_id.clone())
            .or_default()
            .push(self.detections.len());
        self.detections.push(detection);
        Ok(())
    }

    /// All detections of a rule, in insertion order.
    pub fn get(&self, rule_id: &str) -> Vec<&Detection> {
        self.by_rule
            .get(rule_id)
            .map(|indices| indices.iter().map(|&i| &self.detections[i]).collect())
            .unwrap_or_default()
    }

    /// Detections of a rule whose reported node falls inside the scope set.
    pub fn within(&self, rule_id: &str, scope: &ScopeSet) -> Vec<&Detection> {
        self.get(rule_id)
            .into_iter()
            .filter(|d| scope.contains(d.node))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
