use std::collections::{HashMap, HashSet};

use crate::graph::{BlockId, Graph, NodeId, Use, ValueDef, ValueId};

use super::{PatternGraph, SymbolMap};

/// One occurrence of a pattern inside a target graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    anchor: NodeId,
    insertion_point: NodeId,
    nodes: Vec<NodeId>,
    values: HashMap<ValueId, ValueId>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Match {
    /// Target node bound to the pattern anchor.
    pub fn anchor(&self) -> NodeId {
        self.anchor
    }

    /// Last matched node in block order; replacement nodes go right before it.
    pub fn insertion_point(&self) -> NodeId {
        self.insertion_point
    }

    /// Matched target nodes, in pattern body order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Target value bound to the pattern value `pattern_value`.
    pub fn value(&self, pattern_value: ValueId) -> Option<ValueId> {
        self.values.get(&pattern_value).copied()
    }

    /// Target value bound to the pattern variable `name` (with or without `%`).
    pub fn symbol(&self, symbols: &SymbolMap, name: &str) -> Option<ValueId> {
        self.value(symbols.get(name)?)
    }

    /// Target values bound to the pattern's free inputs, in header order.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Target values bound to the pattern's outputs, in `return` order.
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn overlaps(&self, other: &Match) -> bool {
        self.nodes.iter().any(|node| other.contains_node(*node))
    }
}

/// Lazy iterator over the matches of a pattern in a target graph.
///
/// Anchor candidates are snapshotted when the iterator is created.
pub struct Matches<'a> {
    target: &'a Graph,
    pattern: &'a PatternGraph,
    candidates: std::vec::IntoIter<NodeId>,
}

impl Iterator for Matches<'_> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        for anchor in self.candidates.by_ref() {
            if !self.target.contains_node(anchor) {
                continue;
            }
            if let Some(found) = match_at(self.target, self.pattern, anchor) {
                return Some(found);
            }
        }
        None
    }
}

/// Enumerates every occurrence of `pattern` in `target`, in walk order of the anchors.
pub fn match_all<'a>(target: &'a Graph, pattern: &'a PatternGraph) -> Matches<'a> {
    let candidates = match pattern.anchor_kind() {
        Some(kind) => target
            .walk()
            .into_iter()
            .filter(|node| target.kind(*node) == Some(kind))
            .collect(),
        None => Vec::new(),
    };
    Matches {
        target,
        pattern,
        candidates: candidates.into_iter(),
    }
}

/// Tries to match `pattern` with its anchor bound to the target node `anchor`.
pub fn match_at(target: &Graph, pattern: &PatternGraph, anchor: NodeId) -> Option<Match> {
    let pattern_anchor = pattern.anchor()?;
    let anchor_index = pattern.node_index(pattern_anchor)?;
    let block = target.node(anchor)?.block();
    let cx = MatchContext {
        pattern,
        target,
        block,
    };

    let mut state = MatchState::new(pattern);
    state.bind_node(&cx, anchor_index, anchor)?;
    let found = state.solve(&cx, anchor);
    tracing::trace!(
        anchor = %anchor,
        kind = target.kind(anchor).unwrap_or_default(),
        matched = found.is_some(),
        "anchor attempt"
    );
    found
}

struct MatchContext<'a> {
    pattern: &'a PatternGraph,
    target: &'a Graph,
    block: BlockId,
}

#[derive(Debug, Clone)]
struct MatchState {
    node_map: Vec<Option<NodeId>>,
    value_map: HashMap<ValueId, ValueId>,
    used: HashSet<NodeId>,
}

impl MatchState {
    fn new(pattern: &PatternGraph) -> Self {
        Self {
            node_map: vec![None; pattern.nodes().len()],
            value_map: HashMap::new(),
            used: HashSet::new(),
        }
    }

    fn bind_node(&mut self, cx: &MatchContext<'_>, index: usize, target_node: NodeId) -> Option<()> {
        if let Some(existing) = self.node_map[index] {
            return (existing == target_node).then_some(());
        }
        if self.used.contains(&target_node) {
            return None;
        }
        let pattern_node = cx.pattern.nodes()[index];
        if !compatible(cx, pattern_node, target_node) {
            return None;
        }

        let pattern_data = cx.pattern.graph().node(pattern_node)?;
        let target_data = cx.target.node(target_node)?;

        let mut fork = self.clone();
        fork.node_map[index] = Some(target_node);
        fork.used.insert(target_node);
        for (pattern_value, target_value) in
            pattern_data.outputs().iter().zip(target_data.outputs())
        {
            fork.bind_value(*pattern_value, *target_value)?;
        }
        for (pattern_value, target_value) in pattern_data.inputs().iter().zip(target_data.inputs())
        {
            fork.match_input(cx, *pattern_value, *target_value)?;
        }
        *self = fork;
        Some(())
    }

    fn bind_value(&mut self, pattern_value: ValueId, target_value: ValueId) -> Option<()> {
        match self.value_map.get(&pattern_value) {
            Some(existing) => (*existing == target_value).then_some(()),
            None => {
                self.value_map.insert(pattern_value, target_value);
                Some(())
            }
        }
    }

    fn match_input(
        &mut self,
        cx: &MatchContext<'_>,
        pattern_value: ValueId,
        target_value: ValueId,
    ) -> Option<()> {
        if let Some(existing) = self.value_map.get(&pattern_value) {
            return (*existing == target_value).then_some(());
        }
        let pattern_def = cx.pattern.graph().value(pattern_value)?.def();
        let ValueDef::NodeOutput { node, index } = pattern_def else {
            // Free input: binds any target value.
            self.value_map.insert(pattern_value, target_value);
            return Some(());
        };
        let ValueDef::NodeOutput {
            node: target_producer,
            index: target_index,
        } = cx.target.value(target_value)?.def()
        else {
            return None;
        };
        if index != target_index {
            return None;
        }
        let producer_index = cx.pattern.node_index(node)?;
        self.bind_node(cx, producer_index, target_producer)?;
        (self.value_map.get(&pattern_value) == Some(&target_value)).then_some(())
    }

    /// Extends the match forward through pattern uses of already bound values,
    /// backtracking over candidate users until a complete binding passes `finish`.
    fn solve(&self, cx: &MatchContext<'_>, anchor: NodeId) -> Option<Match> {
        if self.node_map.iter().all(Option::is_some) {
            return self.clone().finish(cx, anchor);
        }
        let (pattern_value, user_index, operand) = self.find_unmatched_use(cx)?;
        let target_value = *self.value_map.get(&pattern_value)?;

        for site in cx.target.uses(target_value) {
            let Use::Node {
                node: candidate,
                operand: candidate_operand,
            } = *site
            else {
                continue;
            };
            if candidate_operand != operand || self.used.contains(&candidate) {
                continue;
            }
            let mut fork = self.clone();
            if fork.bind_node(cx, user_index, candidate).is_none() {
                continue;
            }
            if let Some(solved) = fork.solve(cx, anchor) {
                return Some(solved);
            }
        }
        None
    }

    fn find_unmatched_use(&self, cx: &MatchContext<'_>) -> Option<(ValueId, usize, usize)> {
        let pattern = cx.pattern.graph();
        for (index, bound) in self.node_map.iter().enumerate() {
            if bound.is_none() {
                continue;
            }
            let data = pattern.node(cx.pattern.nodes()[index])?;
            for value in data.outputs() {
                for site in pattern.uses(*value) {
                    let Use::Node { node, operand } = *site else {
                        continue;
                    };
                    let user_index = cx.pattern.node_index(node)?;
                    if self.node_map[user_index].is_none() {
                        return Some((*value, user_index, operand));
                    }
                }
            }
        }
        None
    }

    /// Checks the whole-match conditions and builds the [`Match`].
    fn finish(self, cx: &MatchContext<'_>, anchor: NodeId) -> Option<Match> {
        let pattern = cx.pattern;
        let target = cx.target;
        let nodes: Vec<NodeId> = self.node_map.iter().copied().collect::<Option<_>>()?;

        let mut inputs = Vec::with_capacity(pattern.inputs().len());
        for input in pattern.inputs() {
            let bound = *self.value_map.get(input)?;
            if target
                .producer(bound)
                .is_some_and(|producer| self.used.contains(&producer))
            {
                return None;
            }
            inputs.push(bound);
        }

        let outputs: Vec<ValueId> = pattern
            .outputs()
            .iter()
            .map(|output| self.value_map.get(output).copied())
            .collect::<Option<_>>()?;

        for pattern_node in pattern.nodes() {
            let data = pattern.graph().node(*pattern_node)?;
            for value in data.outputs() {
                if pattern.outputs().contains(value) {
                    continue;
                }
                let bound = *self.value_map.get(value)?;
                let escapes = target.uses(bound).iter().any(|site| match site {
                    Use::Node { node, .. } => !self.used.contains(node),
                    Use::Return { .. } => true,
                });
                if escapes {
                    return None;
                }
            }
        }

        let positions: HashMap<NodeId, usize> = target
            .nodes_in_block(cx.block)
            .iter()
            .enumerate()
            .map(|(pos, node)| (*node, pos))
            .collect();
        let insertion_point = nodes
            .iter()
            .copied()
            .max_by_key(|node| positions.get(node).copied().unwrap_or(0))?;
        let insertion_pos = *positions.get(&insertion_point)?;

        for output in &outputs {
            for site in target.uses(*output) {
                let user = match *site {
                    Use::Node { node, .. } if self.used.contains(&node) => continue,
                    Use::Node { node, .. } => node,
                    Use::Return { block, .. } if block == cx.block => continue,
                    Use::Return { block, .. } => target.block(block)?.owner()?,
                };
                let ancestor = target.ancestor_in_block(user, cx.block)?;
                if positions.get(&ancestor).copied()? <= insertion_pos {
                    return None;
                }
            }
        }

        Some(Match {
            anchor,
            insertion_point,
            nodes,
            values: self.value_map,
            inputs,
            outputs,
        })
    }
}

fn compatible(cx: &MatchContext<'_>, pattern_node: NodeId, target_node: NodeId) -> bool {
    let (Some(pattern), Some(target)) = (
        cx.pattern.graph().node(pattern_node),
        cx.target.node(target_node),
    ) else {
        return false;
    };
    pattern.kind() == target.kind()
        && pattern.inputs().len() == target.inputs().len()
        && pattern.outputs().len() == target.outputs().len()
        && target.blocks().is_empty()
        && target.block() == cx.block
        && pattern
            .attributes()
            .iter()
            .all(|(name, value)| target.attr(name) == Some(value))
}
