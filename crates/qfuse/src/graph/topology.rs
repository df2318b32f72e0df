use std::collections::{HashMap, HashSet};

use slotmap::Key;
use thiserror::Error;

use super::{BlockId, Graph, NodeId, Use, ValueId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node {node} uses value {value} before it is defined in scope")]
    UseBeforeDef { node: NodeId, value: ValueId },
    #[error("block {block} returns value {value} that is not visible in the block")]
    ReturnOutOfScope { block: BlockId, value: ValueId },
    #[error("use list of value {value} does not match its consumers")]
    UseListMismatch { value: ValueId },
}

/// Validates that every operand and return entry refers to a value defined
/// earlier in the same block or an enclosing one, and that use lists agree
/// with the operands actually stored on nodes and blocks.
pub fn validate_topology(graph: &Graph) -> Result<(), TopologyError> {
    let mut visible: HashSet<ValueId> = HashSet::new();
    let mut expected: HashMap<ValueId, Vec<Use>> = HashMap::new();
    validate_block(graph, graph.root(), &mut visible, &mut expected)?;

    for (value, mut uses) in expected {
        let mut recorded = graph.uses(value).to_vec();
        uses.sort_by_key(use_key);
        recorded.sort_by_key(use_key);
        if uses != recorded {
            return Err(TopologyError::UseListMismatch { value });
        }
    }
    Ok(())
}

fn validate_block(
    graph: &Graph,
    block: BlockId,
    visible: &mut HashSet<ValueId>,
    expected: &mut HashMap<ValueId, Vec<Use>>,
) -> Result<(), TopologyError> {
    let Some(entry) = graph.block(block) else {
        return Ok(());
    };
    let mut introduced: Vec<ValueId> = Vec::new();
    for param in entry.params() {
        expected.entry(*param).or_default();
        if visible.insert(*param) {
            introduced.push(*param);
        }
    }

    for node in entry.nodes() {
        let Some(data) = graph.node(*node) else {
            continue;
        };
        for (operand, value) in data.inputs().iter().enumerate() {
            if !visible.contains(value) {
                return Err(TopologyError::UseBeforeDef {
                    node: *node,
                    value: *value,
                });
            }
            expected.entry(*value).or_default().push(Use::Node {
                node: *node,
                operand,
            });
        }
        for inner in data.blocks() {
            validate_block(graph, *inner, visible, expected)?;
        }
        for output in data.outputs() {
            expected.entry(*output).or_default();
            if visible.insert(*output) {
                introduced.push(*output);
            }
        }
    }

    for (index, value) in entry.outputs().iter().enumerate() {
        if !visible.contains(value) {
            return Err(TopologyError::ReturnOutOfScope {
                block,
                value: *value,
            });
        }
        expected
            .entry(*value)
            .or_default()
            .push(Use::Return { block, index });
    }

    for value in introduced {
        visible.remove(&value);
    }
    Ok(())
}

fn use_key(site: &Use) -> (u8, u64, usize) {
    match site {
        Use::Node { node, operand } => (0, node.data().as_ffi(), *operand),
        Use::Return { block, index } => (1, block.data().as_ffi(), *index),
    }
}
