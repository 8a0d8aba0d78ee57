//! Owned syntax trees over tree-sitter parses.
//!
//! The engine never touches `tree_sitter::Node` directly: a parse is copied
//! into a pre-order arena where every node carries its subtree extent, so
//! descendant checks and scope lookups are interval tests instead of tree
//! walks. Pre-order ids double as the stable ordering key for detections.

use thiserror::Error;
use tree_sitter::Parser;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("tree-sitter rejected the {0} grammar: {1}")]
    Grammar(&'static str, String),
    #[error("failed to parse {0} source")]
    Failed(&'static str),
}

/// Source languages the scanner can parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Ruby,
    JavaScript,
}

impl Language {
    /// Resolve a language tag as it appears in rule files.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ruby" => Some(Language::Ruby),
            "javascript" => Some(Language::JavaScript),
            _ => None,
        }
    }

    /// Resolve a language from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "rb" | "erb" => Some(Language::Ruby),
            "js" | "mjs" | "cjs" | "jsx" => Some(Language::JavaScript),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Language::Ruby => "ruby",
            Language::JavaScript => "javascript",
        }
    }

    fn grammar(&self) -> tree_sitter::Language {
        match self {
            Language::Ruby => tree_sitter_ruby::LANGUAGE.into(),
            Language::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        }
    }

    /// Parse source text into an owned syntax tree.
    ///
    /// Parsers are created per call since tree-sitter's `Parser` is `!Send`;
    /// creation is cheap relative to a parse.
    pub fn parse(&self, source: &str) -> Result<SyntaxTree, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&self.grammar())
            .map_err(|e| ParseError::Grammar(self.tag(), e.to_string()))?;

        let ts_tree = parser
            .parse(source, None)
            .ok_or(ParseError::Failed(self.tag()))?;

        Ok(SyntaxTree::from_ts(*self, source, ts_tree))
    }

    /// Nodes beyond which `cursor` scope does not traverse: new lexical
    /// binding environments (function/method/block/class bodies).
    pub fn is_binding_boundary(&self, kind: &str) -> bool {
        match self {
            Language::Ruby => matches!(
                kind,
                "method"
                    | "singleton_method"
                    | "class"
                    | "singleton_class"
                    | "module"
                    | "block"
                    | "do_block"
                    | "lambda"
            ),
            Language::JavaScript => matches!(
                kind,
                "function_declaration"
                    | "function_expression"
                    | "arrow_function"
                    | "generator_function"
                    | "generator_function_declaration"
                    | "method_definition"
                    | "class_declaration"
                    | "class"
                    | "statement_block"
            ),
        }
    }

    /// Children the structural matcher skips entirely.
    pub fn is_comment(&self, kind: &str) -> bool {
        kind == "comment"
    }

    /// Trailing children a template may leave unmatched: a concrete call can
    /// carry a block the pattern never mentions.
    pub fn is_trailing_ignorable(&self, kind: &str) -> bool {
        match self {
            Language::Ruby => matches!(kind, "block" | "do_block"),
            Language::JavaScript => false,
        }
    }

    /// Whether nodes of this kind are string literals, for predicates that
    /// operate on literal content rather than node text.
    pub fn is_string_literal(&self, kind: &str) -> bool {
        match self {
            Language::Ruby => matches!(kind, "string" | "simple_symbol" | "string_content"),
            Language::JavaScript => matches!(kind, "string" | "template_string" | "string_fragment"),
        }
    }
}

/// Strip one layer of matching quotes (or a leading `:` for Ruby symbols)
/// from a literal's source text.
pub fn string_literal_content(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"')
            || (first == b'\'' && last == b'\'')
            || (first == b'`' && last == b'`')
        {
            return &text[1..text.len() - 1];
        }
    }
    text.strip_prefix(':').unwrap_or(text)
}

/// Pre-order index of a node within its [`SyntaxTree`].
///
/// Ids are dense: a node's descendants occupy the half-open interval
/// `[id + 1, subtree_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct NodeData {
    kind: &'static str,
    start_byte: usize,
    end_byte: usize,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Exclusive pre-order end of this node's subtree.
    subtree_end: u32,
    is_error: bool,
}

/// An owned syntax tree: source text plus a pre-order node arena.
#[derive(Debug)]
pub struct SyntaxTree {
    language: Language,
    source: String,
    nodes: Vec<NodeData>,
    line_starts: Vec<usize>,
    has_errors: bool,
}

impl SyntaxTree {
    fn from_ts(language: Language, source: &str, ts_tree: tree_sitter::Tree) -> Self {
        let mut nodes = Vec::new();
        let root = ts_tree.root_node();
        let has_errors = root.has_error();
        Self::copy_node(root, None, &mut nodes);

        let mut line_starts = vec![0usize];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }

        Self {
            language,
            source: source.to_string(),
            nodes,
            line_starts,
            has_errors,
        }
    }

    /// Copy a tree-sitter node and its named children into the arena,
    /// assigning pre-order ids. Unnamed children (punctuation, keywords)
    /// are dropped; their information is implied by the parent's kind.
    fn copy_node(
        ts_node: tree_sitter::Node<'_>,
        parent: Option<NodeId>,
        nodes: &mut Vec<NodeData>,
    ) -> NodeId {
        let id = NodeId(nodes.len() as u32);
        nodes.push(NodeData {
            kind: ts_node.kind(),
            start_byte: ts_node.start_byte(),
            end_byte: ts_node.end_byte(),
            parent,
            children: Vec::new(),
            subtree_end: 0,
            is_error: ts_node.is_error() || ts_node.is_missing(),
        });

        let mut cursor = ts_node.walk();
        let children: Vec<tree_sitter::Node<'_>> = ts_node.named_children(&mut cursor).collect();
        for child in children {
            let child_id = Self::copy_node(child, Some(id), nodes);
            nodes[id.index()].children.push(child_id);
        }

        nodes[id.index()].subtree_end = nodes.len() as u32;
        id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the parse contained ERROR or missing nodes.
    pub fn has_parse_errors(&self) -> bool {
        self.has_errors
    }

    pub fn kind(&self, id: NodeId) -> &str {
        self.nodes[id.index()].kind
    }

    pub fn is_error_node(&self, id: NodeId) -> bool {
        self.nodes[id.index()].is_error
    }

    pub fn byte_range(&self, id: NodeId) -> std::ops::Range<usize> {
        let n = &self.nodes[id.index()];
        n.start_byte..n.end_byte
    }

    /// Exact source slice of a node.
    pub fn text(&self, id: NodeId) -> &str {
        let n = &self.nodes[id.index()];
        &self.source[n.start_byte..n.end_byte]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// Named children in source order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    /// Exclusive pre-order end of the node's subtree.
    pub fn subtree_end(&self, id: NodeId) -> NodeId {
        NodeId(self.nodes[id.index()].subtree_end)
    }

    /// Whether `descendant` lies within `ancestor`'s subtree (inclusive).
    pub fn contains(&self, ancestor: NodeId, descendant: NodeId) -> bool {
        ancestor <= descendant && descendant < self.subtree_end(ancestor)
    }

    /// All node ids in pre-order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// 1-indexed (line, column) of the node's start. Columns are byte
    /// offsets within the line.
    pub fn start_position(&self, id: NodeId) -> (usize, usize) {
        self.position_of_byte(self.nodes[id.index()].start_byte)
    }

    pub fn end_position(&self, id: NodeId) -> (usize, usize) {
        self.position_of_byte(self.nodes[id.index()].end_byte)
    }

    fn position_of_byte(&self, byte: usize) -> (usize, usize) {
        let line_idx = match self.line_starts.binary_search(&byte) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line_idx + 1, byte - self.line_starts[line_idx] + 1)
    }

    /// Full text of a 1-indexed source line, without the trailing newline.
    pub fn line_text(&self, line: usize) -> &str {
        let start = self.line_starts[line - 1];
        let end = self
            .line_starts
            .get(line)
            .map(|&next| next - 1)
            .unwrap_or(self.source.len());
        self.source[start..end].trim_end_matches('\r')
    }
}
