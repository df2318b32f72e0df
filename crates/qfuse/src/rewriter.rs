use std::collections::{HashMap, HashSet};

use crate::graph::{Graph, NodeId, NodeSpec, Use, ValueId};
use crate::pattern::{Match, PatternGraph};

/// Result of splicing one match out of the target graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    /// Replacement nodes in insertion order.
    pub inserted: Vec<NodeId>,
    /// Target values that now stand in for the match outputs.
    pub outputs: Vec<ValueId>,
    pub removed: usize,
    /// Constants that fed the match and lost their last consumer.
    pub orphaned_constants: Vec<NodeId>,
}

/// Splices matched subgraphs out of a graph and replacement subgraphs in.
pub struct SubgraphRewriter<'g> {
    graph: &'g mut Graph,
}

impl<'g> SubgraphRewriter<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    /// Replaces `matched` (an occurrence of `pattern`) with an instance of `replacement`.
    ///
    /// Replacement inputs bind positionally to the match's free inputs and the
    /// replacement nodes are inserted right before the insertion point. Every
    /// consumer of a match output outside the match is redirected to the
    /// corresponding replacement output, then the matched nodes are removed.
    ///
    /// # Panics
    ///
    /// Panics before touching the graph when the match is stale, the arities of
    /// match, pattern and replacement disagree, or a consumer outside the match
    /// would end up before the replacement.
    pub fn apply(
        &mut self,
        matched: &Match,
        pattern: &PatternGraph,
        replacement: &PatternGraph,
    ) -> RewriteOutcome {
        self.validate(matched, pattern, replacement);

        let mut mapping: HashMap<ValueId, ValueId> = replacement
            .inputs()
            .iter()
            .copied()
            .zip(matched.inputs().iter().copied())
            .collect();

        let mut inserted = Vec::with_capacity(replacement.nodes().len());
        for node in replacement.nodes() {
            let data = replacement
                .graph()
                .node(*node)
                .expect("replacement nodes are live");
            let mut spec = NodeSpec::new(data.kind()).inputs(
                data.inputs()
                    .iter()
                    .map(|value| mapping[value]),
            );
            for (name, value) in data.attributes() {
                spec = spec.attr(name.clone(), value.clone());
            }
            for output in data.outputs() {
                let ty = replacement
                    .graph()
                    .value_type(*output)
                    .cloned()
                    .expect("replacement values are live");
                spec = spec.output(ty);
            }
            let new_node = self
                .graph
                .insert_node_before(matched.insertion_point(), spec)
                .expect("insertion point and inputs validated");
            let new_outputs = self
                .graph
                .node(new_node)
                .map(|entry| entry.outputs().to_vec())
                .unwrap_or_default();
            for (old, new) in data.outputs().iter().zip(new_outputs) {
                mapping.insert(*old, new);
            }
            inserted.push(new_node);
        }

        let outputs: Vec<ValueId> = replacement
            .outputs()
            .iter()
            .map(|value| mapping[value])
            .collect();
        let inserted_set: HashSet<NodeId> = inserted.iter().copied().collect();
        for (old, new) in matched.outputs().iter().zip(&outputs) {
            let produced_here = self
                .graph
                .producer(*new)
                .is_some_and(|node| inserted_set.contains(&node));
            if produced_here {
                let ty = self.graph.value_type(*old).cloned();
                let name = self.graph.value_name(*old).map(str::to_string);
                if let Some(ty) = ty {
                    self.graph
                        .set_value_type(*new, ty)
                        .expect("replacement output is live");
                }
                self.graph
                    .set_value_name(*new, name)
                    .expect("replacement output is live");
            }
        }

        let keep: HashSet<NodeId> = matched.nodes().iter().copied().collect();
        for (old, new) in matched.outputs().iter().zip(&outputs) {
            self.graph
                .replace_uses_with_except(*old, *new, &keep)
                .expect("match outputs validated");
        }

        let mut doomed: Vec<(usize, NodeId)> = matched
            .nodes()
            .iter()
            .map(|node| {
                let position = self.graph.position(*node).expect("matched node is live");
                (position, *node)
            })
            .collect();
        doomed.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, node) in &doomed {
            self.graph
                .remove_node(*node)
                .expect("matched node has no remaining uses");
        }

        let mut orphaned_constants = Vec::new();
        for input in matched.inputs() {
            let Some(producer) = self.graph.producer(*input) else {
                continue;
            };
            if self.graph.is_constant(producer)
                && self.graph.uses(*input).is_empty()
                && !orphaned_constants.contains(&producer)
            {
                orphaned_constants.push(producer);
            }
        }

        RewriteOutcome {
            inserted,
            outputs,
            removed: doomed.len(),
            orphaned_constants,
        }
    }

    /// Removes the listed constants that still have no consumers; returns how many.
    pub fn prune_constants(&mut self, candidates: &[NodeId]) -> usize {
        let mut removed = 0;
        for node in candidates {
            if !self.graph.is_constant(*node) {
                continue;
            }
            if self.graph.remove_node(*node).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Verifies def-before-use and use-list invariants after mutations.
    pub fn verify(&self) -> bool {
        self.graph.validate().is_ok()
    }

    fn validate(&self, matched: &Match, pattern: &PatternGraph, replacement: &PatternGraph) {
        let graph = &*self.graph;
        for node in matched.nodes() {
            assert!(graph.contains_node(*node), "matched node {node} is stale");
        }
        for input in matched.inputs() {
            assert!(graph.contains_value(*input), "matched input {input} is stale");
        }
        assert_eq!(
            matched.outputs().len(),
            pattern.outputs().len(),
            "match outputs do not correspond to the pattern outputs"
        );
        assert_eq!(
            pattern.outputs().len(),
            replacement.outputs().len(),
            "pattern and replacement output counts differ"
        );
        assert_eq!(
            matched.inputs().len(),
            replacement.inputs().len(),
            "replacement inputs do not correspond to the match inputs"
        );

        let matched_set: HashSet<NodeId> = matched.nodes().iter().copied().collect();
        let insertion = matched.insertion_point();
        assert!(
            matched_set.contains(&insertion),
            "insertion point {insertion} is not part of the match"
        );
        let block = graph
            .node(insertion)
            .map(|node| node.block())
            .expect("insertion point is live");
        let insertion_pos = graph.position(insertion).expect("insertion point is live");

        for node in matched.nodes() {
            let data = graph.node(*node).expect("checked above");
            for value in data.outputs() {
                let is_output = matched.outputs().contains(value);
                for site in graph.uses(*value) {
                    let user = match *site {
                        Use::Node { node: user, .. } if matched_set.contains(&user) => continue,
                        Use::Node { node: user, .. } => Some(user),
                        Use::Return { block: returned, .. } if returned == block => None,
                        Use::Return { block: returned, .. } => {
                            Some(graph.block(returned).and_then(|b| b.owner()).unwrap_or_else(
                                || panic!("value {value} is returned from an enclosing scope"),
                            ))
                        }
                    };
                    assert!(
                        is_output,
                        "non-output value {value} has a consumer outside the match"
                    );
                    if let Some(user) = user {
                        let after = graph
                            .ancestor_in_block(user, block)
                            .and_then(|ancestor| graph.position(ancestor))
                            .is_some_and(|pos| pos > insertion_pos);
                        assert!(
                            after,
                            "consumer {user} of {value} precedes the insertion point"
                        );
                    }
                }
            }
        }

        for node in replacement.nodes() {
            let data = replacement
                .graph()
                .node(*node)
                .expect("replacement nodes are live");
            assert!(
                data.blocks().is_empty(),
                "replacement nodes cannot own blocks"
            );
        }
    }
}
