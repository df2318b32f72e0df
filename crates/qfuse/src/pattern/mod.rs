//! Pattern compilation and subgraph matching.

pub mod matcher;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;

use crate::graph::{Graph, NodeId, Use, ValueId};
use crate::text_ir::{parse_graph_with_symbols, ParseError};

pub use matcher::{match_all, match_at, Match, Matches};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("pattern contains no nodes")]
    Empty,
    #[error("pattern output `%{name}` is not produced by a pattern node")]
    OutputNotProduced { name: String },
    #[error("patterns cannot contain nested blocks")]
    NestedBlock,
    #[error("node `{kind}` is not connected to the anchor")]
    Disconnected { kind: String },
    #[error("pattern input `%{name}` is never used")]
    UnusedInput { name: String },
}

/// Pattern-local variable names (without `%`) mapped to pattern values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolMap {
    values: HashMap<String, ValueId>,
}

impl SymbolMap {
    pub fn new(values: HashMap<String, ValueId>) -> Self {
        Self { values }
    }

    /// Looks up `name`, accepting it with or without the leading `%`.
    pub fn get(&self, name: &str) -> Option<ValueId> {
        self.values
            .get(name.strip_prefix('%').unwrap_or(name))
            .copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ValueId)> + '_ {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Compiled pattern or replacement graph together with its symbol map.
///
/// Patterns produced by [`compile`] are guaranteed to be matchable: they have
/// at least one node, no blocks, every input is consumed, every output comes
/// from a node and every node is reachable from the anchor.
#[derive(Debug, Clone)]
pub struct PatternGraph {
    graph: Graph,
    symbols: SymbolMap,
    nodes: Vec<NodeId>,
    node_index: HashMap<NodeId, usize>,
    anchor: Option<usize>,
}

/// Compiles pattern text into a matchable [`PatternGraph`].
pub fn compile(text: &str) -> Result<PatternGraph, PatternError> {
    let pattern = PatternGraph::parse(text)?;
    pattern.check_matchable()?;
    Ok(pattern)
}

/// Compiles replacement text; only parse errors and nested blocks are rejected.
pub fn compile_replacement(text: &str) -> Result<PatternGraph, PatternError> {
    PatternGraph::parse(text)
}

impl PatternGraph {
    fn parse(text: &str) -> Result<Self, PatternError> {
        let parsed = parse_graph_with_symbols(text)?;
        let graph = parsed.graph;
        let nodes = graph.nodes_in_block(graph.root()).to_vec();
        let nested = nodes.iter().any(|node| {
            graph
                .node(*node)
                .map(|data| !data.blocks().is_empty())
                .unwrap_or(false)
        });
        if nested {
            return Err(PatternError::NestedBlock);
        }
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (*node, idx))
            .collect();
        let anchor = nodes.iter().rposition(|node| {
            graph
                .node(*node)
                .map(|data| {
                    data.outputs()
                        .iter()
                        .any(|value| graph.outputs().contains(value))
                })
                .unwrap_or(false)
        });
        Ok(Self {
            graph,
            symbols: SymbolMap::new(parsed.value_names),
            nodes,
            node_index,
            anchor,
        })
    }

    fn check_matchable(&self) -> Result<(), PatternError> {
        if self.nodes.is_empty() {
            return Err(PatternError::Empty);
        }
        for output in self.graph.outputs() {
            if self.graph.producer(*output).is_none() {
                return Err(PatternError::OutputNotProduced {
                    name: self.display_name(*output),
                });
            }
        }
        for input in self.graph.inputs() {
            if self.graph.uses(*input).is_empty() {
                return Err(PatternError::UnusedInput {
                    name: self.display_name(*input),
                });
            }
        }

        let anchor = match self.anchor {
            Some(index) => self.nodes[index],
            None => {
                let kind = self.kind_of(self.nodes[self.nodes.len() - 1]);
                return Err(PatternError::Disconnected { kind });
            }
        };
        let reached = self.connected_to(anchor);
        if let Some(stray) = self.nodes.iter().find(|node| !reached.contains(*node)) {
            return Err(PatternError::Disconnected {
                kind: self.kind_of(*stray),
            });
        }
        Ok(())
    }

    /// Nodes reachable from `start` through values produced by pattern nodes.
    fn connected_to(&self, start: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let Some(data) = self.graph.node(node) else {
                continue;
            };
            let producers = data
                .inputs()
                .iter()
                .filter_map(|value| self.graph.producer(*value));
            let users = data.outputs().iter().flat_map(|value| {
                self.graph.uses(*value).iter().filter_map(|site| match site {
                    Use::Node { node, .. } => Some(*node),
                    Use::Return { .. } => None,
                })
            });
            for next in producers.chain(users).collect::<Vec<_>>() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    fn kind_of(&self, node: NodeId) -> String {
        self.graph.kind(node).unwrap_or_default().to_string()
    }

    fn display_name(&self, value: ValueId) -> String {
        self.graph
            .value_name(value)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    /// Free inputs in header order.
    pub fn inputs(&self) -> &[ValueId] {
        self.graph.inputs()
    }

    /// Declared outputs in `return` order.
    pub fn outputs(&self) -> &[ValueId] {
        self.graph.outputs()
    }

    /// Pattern nodes in body order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub(crate) fn node_index(&self, node: NodeId) -> Option<usize> {
        self.node_index.get(&node).copied()
    }

    /// The last node in body order that produces a declared output.
    pub fn anchor(&self) -> Option<NodeId> {
        self.anchor.map(|index| self.nodes[index])
    }

    pub fn anchor_kind(&self) -> Option<&str> {
        self.anchor().and_then(|node| self.graph.kind(node))
    }
}

impl fmt::Display for PatternGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.graph, f)
    }
}
