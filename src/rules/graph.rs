//! Reference graph over loaded rules.
//!
//! Rules referencing other rules (filters, sanitizers, required detections,
//! detectors, imports) must be evaluated after their dependencies. The graph
//! is topologically layered at load time; cycles are rejected.

use super::Rule;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deterministic evaluation order: dependencies first, ties broken by rule
/// id ascending.
#[derive(Debug, Clone)]
pub struct EvaluationOrder {
    ordered: Vec<String>,
    layers: BTreeMap<String, usize>,
}

impl EvaluationOrder {
    /// Rule ids in evaluation order.
    pub fn ids(&self) -> &[String] {
        &self.ordered
    }

    /// Topological layer of a rule: 0 for rules with no dependencies.
    pub fn layer(&self, rule_id: &str) -> usize {
        self.layers.get(rule_id).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Compute the evaluation order for a rule set, or return the ids forming a
/// reference cycle. References to ids absent from the map are ignored here;
/// the loader rejects them separately.
pub fn evaluation_order(
    rules: &BTreeMap<String, Arc<Rule>>,
) -> Result<EvaluationOrder, Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = rules.keys().map(|id| (id.as_str(), Mark::Unvisited)).collect();
    let mut layers: BTreeMap<String, usize> = BTreeMap::new();
    let mut stack: Vec<String> = Vec::new();

    // BTreeMap iteration gives a stable visit order, so layer assignment is
    // reproducible across runs.
    for id in rules.keys() {
        if marks[id.as_str()] == Mark::Unvisited {
            visit(id, rules, &mut marks, &mut layers, &mut stack)?;
        }
    }

    let mut ordered: Vec<String> = rules.keys().cloned().collect();
    ordered.sort_by(|a, b| layers[a].cmp(&layers[b]).then_with(|| a.cmp(b)));

    Ok(EvaluationOrder { ordered, layers })
}

fn visit(
    id: &str,
    rules: &BTreeMap<String, Arc<Rule>>,
    marks: &mut BTreeMap<&str, Mark>,
    layers: &mut BTreeMap<String, usize>,
    stack: &mut Vec<String>,
) -> Result<usize, Vec<String>> {
    match marks[id] {
        Mark::Done => return Ok(layers[id]),
        Mark::InProgress => {
            // Slice the DFS stack from the first occurrence of `id` to get
            // the cycle itself rather than the whole path leading to it.
            let from = stack.iter().position(|s| s == id).unwrap_or(0);
            return Err(stack[from..].to_vec());
        }
        Mark::Unvisited => {}
    }

    let rule = &rules[id];
    if let Some(entry) = marks.get_mut(id) {
        *entry = Mark::InProgress;
    }
    stack.push(id.to_string());

    let mut layer = 0usize;
    for dep in rule.referenced_rule_ids() {
        if rules.contains_key(&dep) {
            layer = layer.max(visit(&dep, rules, marks, layers, stack)? + 1);
        }
    }

    stack.pop();
    if let Some(entry) = marks.get_mut(id) {
        *entry = Mark::Done;
    }
    layers.insert(id.to_string(), layer);
    Ok(layer)
}
