//! Reference scope resolution.
//!
//! Given a bound variable's node and a scope tag, compute the set of nodes
//! whose detections a reference filter may consume. Scope sets are pre-order
//! intervals with exclusions, so membership is an interval test rather than
//! a tree walk.

use crate::rules::ReferenceScope;
use crate::tree::{NodeId, SyntaxTree};

/// A set of candidate nodes: one base pre-order interval minus excluded
/// subtrees.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeSet {
    /// Half-open `[start, end)` pre-order interval; `None` is the empty set.
    base: Option<(NodeId, NodeId)>,
    /// Excluded subtree intervals, each half-open.
    exclusions: Vec<(NodeId, NodeId)>,
}

impl ScopeSet {
    pub fn empty() -> Self {
        Self {
            base: None,
            exclusions: Vec::new(),
        }
    }

    pub fn interval(start: NodeId, end: NodeId) -> Self {
        Self {
            base: Some((start, end)),
            exclusions: Vec::new(),
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        let Some((start, end)) = self.base else {
            return false;
        };
        if node < start || node >= end {
            return false;
        }
        !self
            .exclusions
            .iter()
            .any(|&(ex_start, ex_end)| node >= ex_start && node < ex_end)
    }

    pub fn is_empty_set(&self) -> bool {
        self.base.is_none()
    }
}

/// Provenance of a bound variable, for `result` scope: only variables
/// imported from a matched inner detection resolve under `result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Pattern,
    Detection,
}

/// Resolve the candidate node set for `variable_node` under `scope`.
pub fn resolve(
    tree: &SyntaxTree,
    variable_node: NodeId,
    scope: ReferenceScope,
    provenance: Provenance,
) -> ScopeSet {
    let v = variable_node;
    let end = tree.subtree_end(v);
    match scope {
        ReferenceScope::CursorStrict => ScopeSet::interval(v, NodeId(v.0 + 1)),
        ReferenceScope::Nested => ScopeSet::interval(v, end),
        ReferenceScope::NestedStrict => {
            if NodeId(v.0 + 1) < end {
                ScopeSet::interval(NodeId(v.0 + 1), end)
            } else {
                ScopeSet::empty()
            }
        }
        ReferenceScope::Cursor => {
            // The variable's node plus descendants reached without entering
            // a new binding scope: exclude every boundary subtree found
            // before crossing another boundary.
            let mut exclusions = Vec::new();
            collect_boundary_exclusions(tree, v, &mut exclusions);
            ScopeSet {
                base: Some((v, end)),
                exclusions,
            }
        }
        ReferenceScope::Result => match provenance {
            Provenance::Detection => ScopeSet::interval(v, NodeId(v.0 + 1)),
            Provenance::Pattern => ScopeSet::empty(),
        },
    }
}

fn collect_boundary_exclusions(
    tree: &SyntaxTree,
    node: NodeId,
    exclusions: &mut Vec<(NodeId, NodeId)>,
) {
    let language = tree.language();
    for &child in tree.children(node) {
        if language.is_binding_boundary(tree.kind(child)) {
            exclusions.push((child, tree.subtree_end(child)));
        } else {
            collect_boundary_exclusions(tree, child, exclusions);
        }
    }
}
