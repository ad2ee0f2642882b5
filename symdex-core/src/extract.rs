//! Symbol extraction from Python syntax trees

use crate::error::SymdexError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A definition site found in one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    /// Dotted path of enclosing definitions, empty at module scope
    pub scope: String,
    /// Zero-based line
    pub row: usize,
    /// Zero-based byte column
    pub col: usize,
}

/// Statements whose nested blocks are still module (or class) level code
const COMPOUND_STATEMENTS: &[&str] = &[
    "if_statement",
    "for_statement",
    "while_statement",
    "try_statement",
    "with_statement",
    "match_statement",
];

/// Parse `source` and collect its definitions.
///
/// A file with any syntax error is rejected as a whole with
/// [`SymdexError::ParseFailure`]; partial symbol sets are never returned.
pub fn extract_symbols(path: &Path, source: &[u8]) -> crate::Result<Vec<Symbol>> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| parse_failure(path, format!("grammar unavailable: {}", e)))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| parse_failure(path, "parser produced no tree"))?;

    let root = tree.root_node();
    if root.has_error() {
        let message = match first_error(&root) {
            Some(pos) => format!("syntax error at line {}, column {}", pos.row + 1, pos.column + 1),
            None => "syntax error".to_string(),
        };
        return Err(parse_failure(path, message));
    }

    let mut extractor = SymbolExtractor::new(source);
    extractor.visit_block(&root);
    Ok(extractor.symbols)
}

fn parse_failure(path: &Path, message: impl Into<String>) -> SymdexError {
    SymdexError::ParseFailure {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Position of the first ERROR or MISSING node, depth-first
fn first_error(node: &tree_sitter::Node) -> Option<tree_sitter::Point> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position());
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if child.has_error() {
                if let Some(pos) = first_error(&child) {
                    return Some(pos);
                }
            }
        }
    }
    None
}

/// Walks statements with a scope stack.
///
/// Class bodies push the class name. A method body is entered with the
/// method's first parameter as the receiver, so `self.x = ...` is recorded
/// at the class scope; everything else inside a function is local and
/// ignored. Nested classes are recorded but not entered. Expressions are
/// never descended into.
struct SymbolExtractor<'s> {
    source: &'s [u8],
    scope: Vec<String>,
    in_class: bool,
    receiver: Option<String>,
    symbols: Vec<Symbol>,
}

impl<'s> SymbolExtractor<'s> {
    fn new(source: &'s [u8]) -> Self {
        Self {
            source,
            scope: Vec::new(),
            in_class: false,
            receiver: None,
            symbols: Vec::new(),
        }
    }

    fn visit_block(&mut self, node: &tree_sitter::Node) {
        for i in 0..node.named_child_count() {
            if let Some(child) = node.named_child(i) {
                self.visit_statement(&child);
            }
        }
    }

    fn visit_statement(&mut self, node: &tree_sitter::Node) {
        let kind = node.kind();
        match kind {
            "function_definition" => self.visit_function(node),
            "class_definition" => self.visit_class(node),
            "decorated_definition" => {
                if let Some(definition) = node.child_by_field_name("definition") {
                    self.visit_statement(&definition);
                }
            }
            "expression_statement" => {
                for i in 0..node.named_child_count() {
                    if let Some(child) = node.named_child(i) {
                        if child.kind() == "assignment" {
                            self.visit_assignment(&child);
                        }
                    }
                }
            }
            "block" => self.visit_block(node),
            _ if COMPOUND_STATEMENTS.contains(&kind) || kind.ends_with("_clause") => {
                self.visit_compound(node)
            }
            _ => {}
        }
    }

    /// Enter the blocks and clauses of if/for/while/try/with/match, skipping
    /// their conditions and targets.
    fn visit_compound(&mut self, node: &tree_sitter::Node) {
        for i in 0..node.named_child_count() {
            if let Some(child) = node.named_child(i) {
                let kind = child.kind();
                if kind == "block" || kind.ends_with("_clause") {
                    self.visit_statement(&child);
                }
            }
        }
    }

    fn visit_function(&mut self, node: &tree_sitter::Node) {
        if self.receiver.is_some() {
            return;
        }
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        self.add_symbol(self.text(&name), node);

        if !self.in_class {
            return;
        }
        let receiver = node
            .child_by_field_name("parameters")
            .and_then(|params| self.first_parameter(&params));
        if let (Some(receiver), Some(body)) = (receiver, node.child_by_field_name("body")) {
            self.receiver = Some(receiver);
            self.visit_block(&body);
            self.receiver = None;
        }
    }

    fn visit_class(&mut self, node: &tree_sitter::Node) {
        if self.receiver.is_some() {
            return;
        }
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(&name);
        self.add_symbol(name.clone(), node);

        if self.in_class {
            return;
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.scope.push(name);
            self.in_class = true;
            self.visit_block(&body);
            self.in_class = false;
            self.scope.pop();
        }
    }

    fn visit_assignment(&mut self, node: &tree_sitter::Node) {
        // `x: int` without a value declares nothing
        let Some(right) = node.child_by_field_name("right") else {
            return;
        };
        if let Some(left) = node.child_by_field_name("left") {
            self.visit_target(&left);
        }
        // a = b = value
        if right.kind() == "assignment" {
            self.visit_assignment(&right);
        }
    }

    fn visit_target(&mut self, node: &tree_sitter::Node) {
        match node.kind() {
            "identifier" => {
                if self.receiver.is_none() {
                    self.add_symbol(self.text(node), node);
                }
            }
            "attribute" => {
                let Some(receiver) = self.receiver.as_deref() else {
                    return;
                };
                let object = node.child_by_field_name("object");
                let attribute = node.child_by_field_name("attribute");
                if let (Some(object), Some(attribute)) = (object, attribute) {
                    if object.kind() == "identifier" && self.text(&object) == receiver {
                        self.add_symbol(self.text(&attribute), node);
                    }
                }
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" | "list_splat_pattern" | "list_splat"
            | "parenthesized_expression" => {
                for i in 0..node.named_child_count() {
                    if let Some(child) = node.named_child(i) {
                        self.visit_target(&child);
                    }
                }
            }
            _ => {}
        }
    }

    /// Name of the first positional parameter, if the first parameter is one
    fn first_parameter(&self, params: &tree_sitter::Node) -> Option<String> {
        let first = (0..params.named_child_count())
            .filter_map(|i| params.named_child(i))
            .find(|n| n.kind() != "comment")?;
        match first.kind() {
            "identifier" => Some(self.text(&first)),
            "typed_parameter" => first
                .named_child(0)
                .filter(|n| n.kind() == "identifier")
                .map(|n| self.text(&n)),
            "default_parameter" | "typed_default_parameter" => first
                .child_by_field_name("name")
                .filter(|n| n.kind() == "identifier")
                .map(|n| self.text(&n)),
            _ => None,
        }
    }

    fn add_symbol(&mut self, name: String, node: &tree_sitter::Node) {
        let pos = node.start_position();
        self.symbols.push(Symbol {
            name,
            scope: self.scope.join("."),
            row: pos.row,
            col: pos.column,
        });
    }

    fn text(&self, node: &tree_sitter::Node) -> String {
        String::from_utf8_lossy(&self.source[node.start_byte()..node.end_byte()]).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(source: &str) -> Vec<(String, String, usize, usize)> {
        extract_symbols(Path::new("test.py"), source.as_bytes())
            .unwrap()
            .into_iter()
            .map(|s| (s.name, s.scope, s.row, s.col))
            .collect()
    }

    fn names(source: &str) -> Vec<(String, String)> {
        extract(source)
            .into_iter()
            .map(|(name, scope, _, _)| (name, scope))
            .collect()
    }

    fn pair(name: &str, scope: &str) -> (String, String) {
        (name.to_string(), scope.to_string())
    }

    #[test]
    fn test_method_receiver_attributes_use_class_scope() {
        let symbols = extract("class C:\n    def f(self):\n        self.x = 1\n");
        assert_eq!(
            symbols,
            vec![
                ("C".to_string(), "".to_string(), 0, 0),
                ("f".to_string(), "C".to_string(), 1, 4),
                ("x".to_string(), "C".to_string(), 2, 8),
            ]
        );
    }

    #[test]
    fn test_module_level_definitions() {
        let source = r#"
import os

CONSTANT = 1
a, (b, [c, *rest]) = make()
x = y = 0

def top(arg):
    local = arg
    return local

async def fetch():
    pass

@decorator
def wrapped():
    pass
"#;
        assert_eq!(
            names(source),
            vec![
                pair("CONSTANT", ""),
                pair("a", ""),
                pair("b", ""),
                pair("c", ""),
                pair("rest", ""),
                pair("x", ""),
                pair("y", ""),
                pair("top", ""),
                pair("fetch", ""),
                pair("wrapped", ""),
            ]
        );
    }

    #[test]
    fn test_positions_are_zero_based() {
        let symbols = extract("\n\n    \nif True:\n    value = 3\n");
        assert_eq!(symbols, vec![("value".to_string(), "".to_string(), 4, 4)]);
    }

    #[test]
    fn test_class_body_and_nested_classes() {
        let source = r#"
class Outer(Base):
    attr = 1
    a, b = 1, 2

    class Inner:
        hidden = 2

    @property
    def prop(this):
        this.cached = None
        other.ignored = 1
        local = 3

    def __init__(self, value):
        self.value, self.pair = value, None
        if value:
            self.maybe = value

    @staticmethod
    def helper():
        x = 1
"#;
        assert_eq!(
            names(source),
            vec![
                pair("Outer", ""),
                pair("attr", "Outer"),
                pair("a", "Outer"),
                pair("b", "Outer"),
                pair("Inner", "Outer"),
                pair("prop", "Outer"),
                pair("cached", "Outer"),
                pair("__init__", "Outer"),
                pair("value", "Outer"),
                pair("pair", "Outer"),
                pair("maybe", "Outer"),
                pair("helper", "Outer"),
            ]
        );
    }

    #[test]
    fn test_locals_inside_methods_are_skipped() {
        let source = r#"
class K:
    def run(self):
        def inner():
            pass
        class Local:
            pass
        temp = 1
        self.kept = temp
"#;
        assert_eq!(
            names(source),
            vec![pair("K", ""), pair("run", "K"), pair("kept", "K")]
        );
    }

    #[test]
    fn test_compound_statements_at_module_level() {
        let source = r#"
try:
    import json
    HAVE_JSON = True
except ImportError:
    HAVE_JSON = False
finally:
    done = 1

for item in items:
    seen = item

with open(p) as handle:
    data = handle.read()

while cond:
    last = 1
else:
    ended = 1
"#;
        assert_eq!(
            names(source),
            vec![
                pair("HAVE_JSON", ""),
                pair("HAVE_JSON", ""),
                pair("done", ""),
                pair("seen", ""),
                pair("data", ""),
                pair("last", ""),
                pair("ended", ""),
            ]
        );
    }

    #[test]
    fn test_annotations_and_ignored_targets() {
        let source = r#"
typed: int = 1
declared_only: str
counter += 1
items[0] = 2
obj.attr = 3
"#;
        assert_eq!(names(source), vec![pair("typed", "")]);
    }

    #[test]
    fn test_syntax_error_is_parse_failure() {
        let err = extract_symbols(Path::new("bad.py"), b"def broken(:\n    pass\n").unwrap_err();
        match err {
            SymdexError::ParseFailure { path, message } => {
                assert_eq!(path, Path::new("bad.py"));
                assert!(message.contains("syntax error"), "message: {}", message);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_file_has_no_symbols() {
        assert!(extract("").is_empty());
        assert!(extract("# only a comment\n").is_empty());
    }
}
