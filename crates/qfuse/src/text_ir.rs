use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::graph::{BlockId, Graph, Literal, NodeId, NodeSpec, ValueId, ValueType};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("input is empty")]
    Empty,
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: value `%{name}` is used before it is defined")]
    UndefinedValue { line: usize, name: String },
    #[error("line {line}: value `%{name}` is defined more than once")]
    Redefinition { line: usize, name: String },
    #[error("line {line}: return references undefined value `%{name}`")]
    UndefinedReturn { line: usize, name: String },
    #[error("graph body has no `return` statement")]
    MissingReturn,
}

impl ParseError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            line,
            message: message.into(),
        }
    }
}

/// Parses a graph written in the textual IR syntax.
///
/// # Example
/// ```
/// use qfuse::text_ir::parse_graph;
///
/// let graph = parse_graph(r#"
/// graph(%x, %scale : float, %zp : int):
///   %dq = aten::dequantize(%x)
///   %y = aten::relu(%dq)
///   %q = aten::quantize_per_tensor(%y, %scale, %zp)
///   return (%q)
/// "#).expect("valid graph");
/// assert_eq!(graph.inputs().len(), 3);
/// assert_eq!(graph.node_count(), 3);
/// ```
pub fn parse_graph(src: &str) -> Result<Graph, ParseError> {
    Parser::new(src).parse().map(|parsed| parsed.graph)
}

/// Parses a graph and returns the mapping from textual value names to values.
pub fn parse_graph_with_symbols(src: &str) -> Result<ParsedGraph, ParseError> {
    Parser::new(src).parse()
}

/// Graph paired with the mapping from textual value names (without `%`) to values.
#[derive(Debug, Clone)]
pub struct ParsedGraph {
    pub graph: Graph,
    pub value_names: HashMap<String, ValueId>,
}

/// Builds a `Graph` from the textual IR, panicking on malformed input.
#[macro_export]
macro_rules! qgraph {
    ($src:expr) => {{
        $crate::text_ir::parse_graph($src).expect("failed to parse graph text")
    }};
}

/// Open scope: the root block or a block attached to the last node of its parent.
struct Frame {
    block: BlockId,
    last_node: Option<NodeId>,
    defined: Vec<String>,
}

struct Parser<'a> {
    source: &'a str,
}

struct ParseState {
    graph: Graph,
    names: HashMap<String, ValueId>,
    visible: HashSet<String>,
    frames: Vec<Frame>,
    returned: bool,
}

impl ParseState {
    fn current(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("root frame is never popped")
    }

    fn define(&mut self, line: usize, name: String, value: ValueId) -> Result<(), ParseError> {
        if self.names.contains_key(&name) {
            return Err(ParseError::Redefinition { line, name });
        }
        self.names.insert(name.clone(), value);
        self.visible.insert(name.clone());
        self.current().defined.push(name);
        Ok(())
    }

    fn resolve(&self, line: usize, name: &str) -> Result<ValueId, ParseError> {
        match self.names.get(name) {
            Some(value) if self.visible.contains(name) => Ok(*value),
            _ => Err(ParseError::UndefinedValue {
                line,
                name: name.to_string(),
            }),
        }
    }
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self { source }
    }

    fn parse(&self) -> Result<ParsedGraph, ParseError> {
        let mut lines = self
            .source
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (header_line, header) = lines.next().ok_or(ParseError::Empty)?;
        let mut graph = Graph::new();
        let root = graph.root();
        let mut state = ParseState {
            graph,
            names: HashMap::new(),
            visible: HashSet::new(),
            frames: vec![Frame {
                block: root,
                last_node: None,
                defined: Vec::new(),
            }],
            returned: false,
        };

        for (name, ty) in parse_header(header_line, header)? {
            let value = state.graph.add_input(ty);
            let _ = state.graph.set_value_name(value, Some(name.clone()));
            state.define(header_line, name, value)?;
        }

        let mut last_line = header_line;
        for (line, statement) in lines {
            last_line = line;
            if state.returned {
                return Err(ParseError::syntax(line, "statement after `return`"));
            }
            if let Some(values) = statement.strip_prefix("return") {
                self.parse_return(line, values, &mut state)?;
            } else if let Some(values) = statement.strip_prefix("->") {
                self.close_block(line, values, &mut state)?;
            } else if is_block_header(statement) {
                self.open_block(line, statement, &mut state)?;
            } else {
                self.parse_statement(line, statement, &mut state)?;
            }
        }

        if state.frames.len() > 1 {
            return Err(ParseError::syntax(last_line, "unterminated block"));
        }
        if !state.returned {
            return Err(ParseError::MissingReturn);
        }

        Ok(ParsedGraph {
            graph: state.graph,
            value_names: state.names,
        })
    }

    fn parse_return(
        &self,
        line: usize,
        values: &str,
        state: &mut ParseState,
    ) -> Result<(), ParseError> {
        if state.frames.len() > 1 {
            return Err(ParseError::syntax(
                line,
                "`return` inside a block, use `-> (...)`",
            ));
        }
        let names = parse_value_list(line, values)?;
        for name in names {
            let value = state
                .resolve(line, &name)
                .map_err(|_| ParseError::UndefinedReturn { line, name })?;
            state
                .graph
                .register_output(value)
                .map_err(|err| ParseError::syntax(line, err.to_string()))?;
        }
        state.returned = true;
        Ok(())
    }

    fn open_block(
        &self,
        line: usize,
        statement: &str,
        state: &mut ParseState,
    ) -> Result<(), ParseError> {
        let owner = state
            .current()
            .last_node
            .ok_or_else(|| ParseError::syntax(line, "block must follow a node"))?;
        let body = statement
            .strip_suffix(':')
            .ok_or_else(|| ParseError::syntax(line, "block header must end with `:`"))?;
        let open = body
            .find('(')
            .ok_or_else(|| ParseError::syntax(line, "missing `(` in block header"))?;
        let close = find_matching(body, open, '(', ')')
            .ok_or_else(|| ParseError::syntax(line, "missing `)` in block header"))?;
        if !body[close + 1..].trim().is_empty() {
            return Err(ParseError::syntax(line, "unexpected text after block parameters"));
        }

        let block = state
            .graph
            .add_block(owner)
            .map_err(|err| ParseError::syntax(line, err.to_string()))?;
        state.frames.push(Frame {
            block,
            last_node: None,
            defined: Vec::new(),
        });
        for (name, ty) in parse_typed_names(line, &body[open + 1..close])? {
            let value = state
                .graph
                .add_block_param(block, ty)
                .map_err(|err| ParseError::syntax(line, err.to_string()))?;
            let _ = state.graph.set_value_name(value, Some(name.clone()));
            state.define(line, name, value)?;
        }
        Ok(())
    }

    fn close_block(
        &self,
        line: usize,
        values: &str,
        state: &mut ParseState,
    ) -> Result<(), ParseError> {
        if state.frames.len() == 1 {
            return Err(ParseError::syntax(line, "`->` outside of a block"));
        }
        let outputs = parse_value_list(line, values)?
            .into_iter()
            .map(|name| state.resolve(line, &name))
            .collect::<Result<Vec<_>, _>>()?;
        let frame = state.frames.pop().expect("checked above");
        state
            .graph
            .set_block_outputs(frame.block, outputs)
            .map_err(|err| ParseError::syntax(line, err.to_string()))?;
        for name in frame.defined {
            state.visible.remove(&name);
        }
        Ok(())
    }

    fn parse_statement(
        &self,
        line: usize,
        statement: &str,
        state: &mut ParseState,
    ) -> Result<(), ParseError> {
        let (lhs, rhs) = match find_top_level(statement, '=') {
            Some(eq) => (
                Some(statement[..eq].trim()),
                statement[eq + 1..].trim(),
            ),
            None => (None, statement),
        };

        let (kind, rest) = parse_op_name(line, rhs)?;
        let mut attributes = Vec::new();
        let mut rest = rest.trim_start();
        if rest.starts_with('[') {
            let close = find_matching(rest, 0, '[', ']')
                .ok_or_else(|| ParseError::syntax(line, "missing `]` after attributes"))?;
            attributes = parse_attributes(line, &rest[1..close])?;
            rest = rest[close + 1..].trim_start();
        }
        if !rest.starts_with('(') {
            return Err(ParseError::syntax(
                line,
                format!("expected `(` after `{kind}`"),
            ));
        }
        let close = find_matching(rest, 0, '(', ')')
            .ok_or_else(|| ParseError::syntax(line, "missing `)` after operands"))?;
        if !rest[close + 1..].trim().is_empty() {
            return Err(ParseError::syntax(line, "unexpected text after operands"));
        }
        let inputs = parse_value_list(line, &rest[..=close])?
            .into_iter()
            .map(|name| state.resolve(line, &name))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = match lhs {
            Some(lhs) => parse_typed_names_with_defaults(line, lhs)?,
            None => Vec::new(),
        };
        let constant_ty = constant_type(&kind, &attributes);

        let mut spec = NodeSpec::new(kind).inputs(inputs);
        for (name, _) in &attributes {
            if attributes.iter().filter(|(other, _)| other == name).count() > 1 {
                return Err(ParseError::syntax(
                    line,
                    format!("attribute `{name}` given more than once"),
                ));
            }
        }
        for (name, value) in attributes {
            spec = spec.attr(name, value);
        }
        for (name, ty) in &outputs {
            if state.names.contains_key(name) {
                return Err(ParseError::Redefinition {
                    line,
                    name: name.clone(),
                });
            }
            let ty = match (ty, &constant_ty) {
                (Some(ty), _) => ty.clone(),
                (None, Some(literal_ty)) if outputs.len() == 1 => literal_ty.clone(),
                (None, _) => ValueType::Tensor,
            };
            spec = spec.named_output(ty, name.clone());
        }

        let block = state.current().block;
        let node = state
            .graph
            .append_node(block, spec)
            .map_err(|err| ParseError::syntax(line, err.to_string()))?;
        state.current().last_node = Some(node);

        let produced = state
            .graph
            .node(node)
            .map(|data| data.outputs().to_vec())
            .unwrap_or_default();
        for ((name, _), value) in outputs.into_iter().zip(produced) {
            state.define(line, name, value)?;
        }
        Ok(())
    }
}

fn parse_header(line: usize, header: &str) -> Result<Vec<(String, ValueType)>, ParseError> {
    let rest = header
        .strip_prefix("graph")
        .ok_or_else(|| ParseError::syntax(line, "graph header must start with `graph(`"))?
        .trim_start();
    let body = rest
        .strip_suffix(':')
        .ok_or_else(|| ParseError::syntax(line, "graph header must end with `:`"))?
        .trim_end();
    if !body.starts_with('(') {
        return Err(ParseError::syntax(line, "missing `(` in graph header"));
    }
    let close = find_matching(body, 0, '(', ')')
        .ok_or_else(|| ParseError::syntax(line, "missing `)` in graph header"))?;
    if close + 1 != body.len() {
        return Err(ParseError::syntax(line, "unexpected text after graph inputs"));
    }
    parse_typed_names(line, &body[1..close])
}

fn is_block_header(statement: &str) -> bool {
    statement
        .strip_prefix("block")
        .map(|rest| {
            let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            rest.starts_with('(') && statement.ends_with(':')
        })
        .unwrap_or(false)
}

/// `%a, %b : int` with every type defaulting to `Tensor`.
fn parse_typed_names(line: usize, src: &str) -> Result<Vec<(String, ValueType)>, ParseError> {
    Ok(parse_typed_names_with_defaults(line, src)?
        .into_iter()
        .map(|(name, ty)| (name, ty.unwrap_or(ValueType::Tensor)))
        .collect())
}

fn parse_typed_names_with_defaults(
    line: usize,
    src: &str,
) -> Result<Vec<(String, Option<ValueType>)>, ParseError> {
    split_top_level(src, ',')
        .into_iter()
        .map(|decl| {
            let (name, ty) = match decl.split_once(':') {
                Some((name, ty)) => {
                    let parsed = ValueType::parse(ty).ok_or_else(|| {
                        ParseError::syntax(line, format!("unknown type `{}`", ty.trim()))
                    })?;
                    (name.trim(), Some(parsed))
                }
                None => (decl, None),
            };
            Ok((parse_value_name(line, name)?, ty))
        })
        .collect()
}

/// `(%a, %b)` or `%a, %b`.
fn parse_value_list(line: usize, src: &str) -> Result<Vec<String>, ParseError> {
    let trimmed = src.trim();
    let inner = match trimmed.strip_prefix('(') {
        Some(rest) => rest
            .strip_suffix(')')
            .ok_or_else(|| ParseError::syntax(line, "missing `)` in value list"))?,
        None => trimmed,
    };
    split_top_level(inner, ',')
        .into_iter()
        .map(|name| parse_value_name(line, name))
        .collect()
}

fn parse_value_name(line: usize, src: &str) -> Result<String, ParseError> {
    let name = src
        .trim()
        .strip_prefix('%')
        .ok_or_else(|| ParseError::syntax(line, format!("expected `%name`, found `{}`", src.trim())))?;
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '.');
    if !valid {
        return Err(ParseError::syntax(
            line,
            format!("invalid value name `%{name}`"),
        ));
    }
    Ok(name.to_string())
}

fn parse_op_name(line: usize, src: &str) -> Result<(String, &str), ParseError> {
    let trimmed = src.trim_start();
    let end = trimmed
        .find(|ch: char| ch == '(' || ch == '[' || ch.is_whitespace())
        .unwrap_or(trimmed.len());
    let name = &trimmed[..end];
    if name.is_empty() {
        return Err(ParseError::syntax(line, "operation name is missing"));
    }
    let namespaced = name
        .split_once("::")
        .map(|(ns, op)| !ns.is_empty() && !op.is_empty())
        .unwrap_or(false);
    if !namespaced {
        return Err(ParseError::syntax(
            line,
            format!("operation `{name}` must be written as `namespace::op`"),
        ));
    }
    Ok((name.to_string(), &trimmed[end..]))
}

fn parse_attributes(line: usize, src: &str) -> Result<Vec<(String, Literal)>, ParseError> {
    split_top_level(src, ',')
        .into_iter()
        .map(|entry| {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ParseError::syntax(line, "attribute must be `name=value`"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParseError::syntax(line, "attribute name cannot be empty"));
            }
            let literal = parse_literal(value).ok_or_else(|| {
                ParseError::syntax(line, format!("invalid literal `{}`", value.trim()))
            })?;
            Ok((key.to_string(), literal))
        })
        .collect()
}

/// Parses `None`, booleans, quoted strings, `[...]` lists, integers and floats.
pub(crate) fn parse_literal(src: &str) -> Option<Literal> {
    let trimmed = src.trim();
    match trimmed {
        "" => return None,
        "None" => return Some(Literal::None),
        "true" | "True" => return Some(Literal::Bool(true)),
        "false" | "False" => return Some(Literal::Bool(false)),
        _ => {}
    }
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return unescape(&trimmed[1..trimmed.len() - 1], quote).map(Literal::Str);
        }
    }
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return split_top_level(inner, ',')
            .into_iter()
            .map(parse_literal)
            .collect::<Option<Vec<_>>>()
            .map(Literal::List);
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(Literal::Int(value));
    }
    trimmed.parse::<f64>().ok().map(Literal::Float)
}

/// Resolves `\\`, `\"` and `\'`; other backslashes are kept as written.
fn unescape(inner: &str, quote: char) -> Option<String> {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next()? {
                escaped @ ('\\' | '"' | '\'') => out.push(escaped),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            },
            c if c == quote => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

fn constant_type(kind: &str, attributes: &[(String, Literal)]) -> Option<ValueType> {
    if kind.rsplit("::").next() != Some("Constant") {
        return None;
    }
    attributes
        .iter()
        .find(|(key, _)| key == "value")
        .map(|(_, literal)| literal.value_type())
}

/// Tracks whether a scan position sits inside a quoted string.
#[derive(Default)]
struct QuoteScanner {
    open: Option<char>,
    escaped: bool,
}

impl QuoteScanner {
    /// Returns `true` when `ch` belongs to a string literal.
    fn consume(&mut self, ch: char) -> bool {
        match self.open {
            Some(_) if self.escaped => {
                self.escaped = false;
                true
            }
            Some(_) if ch == '\\' => {
                self.escaped = true;
                true
            }
            Some(open) => {
                if ch == open {
                    self.open = None;
                }
                true
            }
            None if ch == '"' || ch == '\'' => {
                self.open = Some(ch);
                true
            }
            None => false,
        }
    }
}

/// Splits on `delimiter` outside of brackets, parentheses and quotes.
fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quotes = QuoteScanner::default();
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        if quotes.consume(ch) {
            continue;
        }
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 => {
                pieces.push(input[start..idx].trim());
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() || !pieces.is_empty() {
        pieces.push(tail);
    }
    pieces
}

fn find_top_level(input: &str, needle: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut quotes = QuoteScanner::default();
    for (idx, ch) in input.char_indices() {
        if quotes.consume(ch) {
            continue;
        }
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            c if c == needle && depth == 0 => return Some(idx),
            _ => {}
        }
    }
    None
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    let mut quotes = QuoteScanner::default();
    for (offset, ch) in src[start..].char_indices() {
        if quotes.consume(ch) {
            continue;
        }
        match ch {
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}
