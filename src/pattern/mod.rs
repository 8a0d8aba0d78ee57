//! Pattern compilation and structural matching.
//!
//! A rule pattern is a source fragment in the rule's target language with
//! metavariable placeholders (`$<NAME>`, `$NAME`, `$_` for anonymous).
//! Compilation rewrites each placeholder to a synthetic identifier, parses
//! the result with the target grammar, and converts the parse into a
//! template tree in which placeholder nodes become wildcard holes.
//!
//! Matching is structural: a wildcard binds any concrete subtree to its
//! name; other template nodes require equal kinds and in-order child
//! matches, skipping comments and tolerating trailing children the language
//! marks ignorable (a Ruby call's `do` block, for example).

use crate::rules::RulePattern;
use crate::tree::{Language, NodeId, SyntaxTree};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("rule {rule_id}: pattern {pattern_index} does not parse as {language}")]
    ParseFailed {
        rule_id: String,
        pattern_index: usize,
        language: &'static str,
    },
    #[error("rule {rule_id}: focus names unknown metavariable '{name}'")]
    UnknownFocus { rule_id: String, name: String },
    #[error("rule {rule_id}: metavariable '{name}' appears more than once")]
    DuplicateMetavar { rule_id: String, name: String },
}

/// A node in a compiled pattern template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateNode {
    /// A metavariable hole. `None` is anonymous (`$_`): matches anything,
    /// binds nothing.
    Wildcard { name: Option<String> },
    Interior {
        kind: String,
        children: Vec<TemplateNode>,
    },
    Leaf { kind: String, text: String },
}

/// Metavariable bindings captured by a match: name to concrete node.
pub type Bindings = BTreeMap<String, NodeId>;

/// A compiled rule pattern ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    /// Position within the rule's pattern list; part of the detection
    /// ordering key.
    pub index: usize,
    pub template: TemplateNode,
    pub focus: Option<String>,
    /// Named metavariables in source order.
    pub variables: Vec<String>,
}

impl CompiledPattern {
    /// Node kind the template root requires, or `None` when the root is a
    /// wildcard and every node is a candidate.
    pub fn root_kind(&self) -> Option<&str> {
        match &self.template {
            TemplateNode::Wildcard { .. } => None,
            TemplateNode::Interior { kind, .. } | TemplateNode::Leaf { kind, .. } => Some(kind),
        }
    }

    /// Attempt a structural match rooted at `node`.
    pub fn match_at(&self, tree: &SyntaxTree, node: NodeId) -> Option<Bindings> {
        let mut bindings = Bindings::new();
        if match_node(tree, node, &self.template, &mut bindings) {
            Some(bindings)
        } else {
            None
        }
    }
}

/// Compile one rule pattern against the rule's target language.
pub fn compile(
    rule_id: &str,
    language: Language,
    pattern: &RulePattern,
    index: usize,
) -> Result<CompiledPattern, CompileError> {
    let lexed = lex_metavariables(rule_id, &pattern.pattern)?;

    let parsed = language.parse(&lexed.rewritten).map_err(|_| {
        CompileError::ParseFailed {
            rule_id: rule_id.to_string(),
            pattern_index: index,
            language: language.tag(),
        }
    })?;
    if parsed.has_parse_errors() {
        return Err(CompileError::ParseFailed {
            rule_id: rule_id.to_string(),
            pattern_index: index,
            language: language.tag(),
        });
    }

    if let Some(focus) = &pattern.focus {
        if !lexed.variables.contains(focus) {
            return Err(CompileError::UnknownFocus {
                rule_id: rule_id.to_string(),
                name: focus.clone(),
            });
        }
    }

    let root = template_root(&parsed);
    let template = build_template(&parsed, root, &lexed.placeholders);

    Ok(CompiledPattern {
        index,
        template,
        focus: pattern.focus.clone(),
        variables: lexed.variables,
    })
}

struct LexedPattern {
    rewritten: String,
    /// Placeholder identifier to metavariable name (`None` for `$_`).
    placeholders: BTreeMap<String, Option<String>>,
    variables: Vec<String>,
}

fn lex_metavariables(rule_id: &str, pattern: &str) -> Result<LexedPattern, CompileError> {
    // Both placeholder spellings: $<NAME> and bare $NAME.
    let metavar = Regex::new(r"\$<([A-Za-z_][A-Za-z0-9_]*)>|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("metavariable pattern is valid");

    let mut rewritten = String::with_capacity(pattern.len());
    let mut placeholders = BTreeMap::new();
    let mut variables = Vec::new();
    let mut last = 0usize;

    for (i, caps) in metavar.captures_iter(pattern).enumerate() {
        let whole = caps.get(0).expect("match");
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .expect("capture")
            .as_str();

        rewritten.push_str(&pattern[last..whole.start()]);
        let placeholder = format!("lhvar{}", i);

        if name == "_" {
            placeholders.insert(placeholder.clone(), None);
        } else {
            if variables.iter().any(|v| v == name) {
                return Err(CompileError::DuplicateMetavar {
                    rule_id: rule_id.to_string(),
                    name: name.to_string(),
                });
            }
            variables.push(name.to_string());
            placeholders.insert(placeholder.clone(), Some(name.to_string()));
        }

        rewritten.push_str(&placeholder);
        last = whole.end();
    }
    rewritten.push_str(&pattern[last..]);

    Ok(LexedPattern {
        rewritten,
        placeholders,
        variables,
    })
}

/// Patterns are fragments, so the parse root is the grammar's program node.
/// A single-statement pattern unwraps to that statement.
fn template_root(tree: &SyntaxTree) -> NodeId {
    let root = tree.root();
    let children = significant_children(tree, root);
    if children.len() == 1 {
        children[0]
    } else {
        root
    }
}

fn significant_children(tree: &SyntaxTree, node: NodeId) -> Vec<NodeId> {
    let language = tree.language();
    tree.children(node)
        .iter()
        .copied()
        .filter(|&c| !language.is_comment(tree.kind(c)))
        .collect()
}

fn build_template(
    tree: &SyntaxTree,
    node: NodeId,
    placeholders: &BTreeMap<String, Option<String>>,
) -> TemplateNode {
    if let Some(name) = placeholders.get(tree.text(node)) {
        return TemplateNode::Wildcard { name: name.clone() };
    }

    let children = significant_children(tree, node);
    if children.is_empty() {
        TemplateNode::Leaf {
            kind: tree.kind(node).to_string(),
            text: tree.text(node).to_string(),
        }
    } else {
        TemplateNode::Interior {
            kind: tree.kind(node).to_string(),
            children: children
                .iter()
                .map(|&c| build_template(tree, c, placeholders))
                .collect(),
        }
    }
}

fn match_node(
    tree: &SyntaxTree,
    node: NodeId,
    template: &TemplateNode,
    bindings: &mut Bindings,
) -> bool {
    match template {
        TemplateNode::Wildcard { name } => {
            if let Some(name) = name {
                // A name bound twice must capture text-equal subtrees.
                if let Some(&previous) = bindings.get(name) {
                    return tree.text(previous) == tree.text(node);
                }
                bindings.insert(name.clone(), node);
            }
            true
        }
        TemplateNode::Leaf { kind, text } => {
            tree.kind(node) == kind && tree.text(node) == text
        }
        TemplateNode::Interior { kind, children } => {
            if tree.kind(node) != kind {
                return false;
            }
            let concrete = significant_children(tree, node);
            if concrete.len() < children.len() {
                return false;
            }
            for (template_child, &concrete_child) in children.iter().zip(concrete.iter()) {
                if !match_node(tree, concrete_child, template_child, bindings) {
                    return false;
                }
            }
            // Unmatched trailing children are allowed only when the language
            // marks them ignorable (a call's attached block).
            let language = tree.language();
            concrete[children.len()..]
                .iter()
                .all(|&extra| language.is_trailing_ignorable(tree.kind(extra)))
        }
    }
}
