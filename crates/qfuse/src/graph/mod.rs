//! Slot-map backed computation graph with nested blocks and def-use tracking.

mod display;
mod topology;
mod types;

use std::collections::HashSet;
use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use slotmap::{new_key_type, Key, SlotMap};

pub use topology::{validate_topology, TopologyError};
pub use types::{Literal, ValueType};

new_key_type! {
    /// Handle to a node; stops resolving once the node is removed.
    pub struct NodeId;
    /// Handle to a value; stops resolving once its definition is removed.
    pub struct ValueId;
    /// Handle to a block (the root scope or a node-owned region).
    pub struct BlockId;
}

macro_rules! display_key {
    ($name:ident, $prefix:literal) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:?}"), self.data())
            }
        }
    };
}

display_key!(NodeId, "n");
display_key!(ValueId, "v");
display_key!(BlockId, "b");

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDef {
    NodeOutput { node: NodeId, index: usize },
    BlockParam { block: BlockId, index: usize },
}

/// A single consumer slot of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Use {
    /// Operand `operand` of `node`.
    Node { node: NodeId, operand: usize },
    /// Entry `index` of the return list of `block`.
    Return { block: BlockId, index: usize },
}

#[derive(Debug, Clone)]
pub struct Node {
    kind: String,
    inputs: SmallVec<[ValueId; 4]>,
    outputs: SmallVec<[ValueId; 2]>,
    attributes: Vec<(String, Literal)>,
    block: BlockId,
    blocks: SmallVec<[BlockId; 2]>,
}

impl Node {
    /// Namespaced operator name, e.g. `aten::conv2d`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn attributes(&self) -> &[(String, Literal)] {
        &self.attributes
    }

    pub fn attr(&self, name: &str) -> Option<&Literal> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Block this node lives in.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Sub-blocks owned by this node.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    ty: ValueType,
    def: ValueDef,
    uses: SmallVec<[Use; 4]>,
    name: Option<String>,
}

impl Value {
    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    pub fn def(&self) -> ValueDef {
        self.def
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    params: Vec<ValueId>,
    nodes: Vec<NodeId>,
    outputs: Vec<ValueId>,
    owner: Option<NodeId>,
}

impl Block {
    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Node owning this block, `None` for the root block.
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }
}

/// Description of a node to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    kind: String,
    inputs: Vec<ValueId>,
    outputs: Vec<(ValueType, Option<String>)>,
    attributes: Vec<(String, Literal)>,
}

impl NodeSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn input(mut self, value: ValueId) -> Self {
        self.inputs.push(value);
        self
    }

    pub fn inputs(mut self, values: impl IntoIterator<Item = ValueId>) -> Self {
        self.inputs.extend(values);
        self
    }

    pub fn output(mut self, ty: ValueType) -> Self {
        self.outputs.push((ty, None));
        self
    }

    pub fn named_output(mut self, ty: ValueType, name: impl Into<String>) -> Self {
        self.outputs.push((ty, Some(name.into())));
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Literal>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} does not exist (removed or never created)")]
    StaleNode(NodeId),
    #[error("value {0} does not exist (removed or never created)")]
    StaleValue(ValueId),
    #[error("block {0} does not exist (removed or never created)")]
    StaleBlock(BlockId),
    #[error("cannot remove node {node}: output {value} still has uses")]
    LiveUses { node: NodeId, value: ValueId },
}

/// Mutable computation graph.
///
/// The root block's parameters are the graph inputs and its return list is the
/// graph outputs. Every handle is version-checked: looking up a removed
/// node, value or block yields `None` (or a `Stale*` error), never a different
/// entity that happens to reuse the slot.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: SlotMap<NodeId, Node>,
    values: SlotMap<ValueId, Value>,
    blocks: SlotMap<BlockId, Block>,
    root: BlockId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut blocks = SlotMap::with_key();
        let root = blocks.insert(Block {
            params: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            owner: None,
        });
        Self {
            nodes: SlotMap::with_key(),
            values: SlotMap::with_key(),
            blocks,
            root,
        }
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.root_block().params
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.root_block().outputs
    }

    /// Appends a graph input of type `ty`.
    pub fn add_input(&mut self, ty: ValueType) -> ValueId {
        let root = self.root;
        self.add_block_param(root, ty)
            .expect("root block is never removed")
    }

    /// Appends `value` to the graph outputs.
    pub fn register_output(&mut self, value: ValueId) -> Result<(), GraphError> {
        let root = self.root;
        let mut outputs = self.root_block().outputs.clone();
        outputs.push(value);
        self.set_block_outputs(root, outputs)
    }

    /// Replaces the return list of `block`.
    pub fn set_block_outputs(
        &mut self,
        block: BlockId,
        outputs: Vec<ValueId>,
    ) -> Result<(), GraphError> {
        if let Some(stale) = outputs.iter().find(|value| !self.contains_value(**value)) {
            return Err(GraphError::StaleValue(*stale));
        }
        let previous = std::mem::take(
            &mut self
                .blocks
                .get_mut(block)
                .ok_or(GraphError::StaleBlock(block))?
                .outputs,
        );
        for (index, value) in previous.iter().enumerate() {
            self.drop_use(*value, Use::Return { block, index });
        }
        for (index, value) in outputs.iter().enumerate() {
            self.add_use(*value, Use::Return { block, index });
        }
        if let Some(entry) = self.blocks.get_mut(block) {
            entry.outputs = outputs;
        }
        Ok(())
    }

    /// Creates a new empty block owned by `owner`.
    pub fn add_block(&mut self, owner: NodeId) -> Result<BlockId, GraphError> {
        if !self.contains_node(owner) {
            return Err(GraphError::StaleNode(owner));
        }
        let block = self.blocks.insert(Block {
            params: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            owner: Some(owner),
        });
        if let Some(node) = self.nodes.get_mut(owner) {
            node.blocks.push(block);
        }
        Ok(block)
    }

    pub fn add_block_param(&mut self, block: BlockId, ty: ValueType) -> Result<ValueId, GraphError> {
        let index = self
            .blocks
            .get(block)
            .ok_or(GraphError::StaleBlock(block))?
            .params
            .len();
        let value = self.values.insert(Value {
            ty,
            def: ValueDef::BlockParam { block, index },
            uses: SmallVec::new(),
            name: None,
        });
        if let Some(entry) = self.blocks.get_mut(block) {
            entry.params.push(value);
        }
        Ok(value)
    }

    /// Appends a node at the end of `block`.
    pub fn append_node(&mut self, block: BlockId, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let index = self
            .blocks
            .get(block)
            .ok_or(GraphError::StaleBlock(block))?
            .nodes
            .len();
        self.insert_node_at(block, index, spec)
    }

    /// Inserts a node immediately before `anchor`, in the anchor's block.
    pub fn insert_node_before(&mut self, anchor: NodeId, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let block = self.node(anchor).ok_or(GraphError::StaleNode(anchor))?.block;
        let index = self
            .position(anchor)
            .ok_or(GraphError::StaleNode(anchor))?;
        self.insert_node_at(block, index, spec)
    }

    fn insert_node_at(
        &mut self,
        block: BlockId,
        index: usize,
        spec: NodeSpec,
    ) -> Result<NodeId, GraphError> {
        if !self.blocks.contains_key(block) {
            return Err(GraphError::StaleBlock(block));
        }
        if let Some(stale) = spec.inputs.iter().find(|value| !self.contains_value(**value)) {
            return Err(GraphError::StaleValue(*stale));
        }

        let node = self.nodes.insert(Node {
            kind: spec.kind,
            inputs: spec.inputs.iter().copied().collect(),
            outputs: SmallVec::new(),
            attributes: spec.attributes,
            block,
            blocks: SmallVec::new(),
        });
        for (operand, value) in spec.inputs.iter().enumerate() {
            self.add_use(*value, Use::Node { node, operand });
        }
        let outputs: SmallVec<[ValueId; 2]> = spec
            .outputs
            .into_iter()
            .enumerate()
            .map(|(index, (ty, name))| {
                self.values.insert(Value {
                    ty,
                    def: ValueDef::NodeOutput { node, index },
                    uses: SmallVec::new(),
                    name,
                })
            })
            .collect();
        if let Some(entry) = self.nodes.get_mut(node) {
            entry.outputs = outputs;
        }
        if let Some(entry) = self.blocks.get_mut(block) {
            entry.nodes.insert(index, node);
        }
        Ok(node)
    }

    /// Removes `node`, its outputs and every block it owns.
    ///
    /// Fails when any output still has consumers; values defined inside the
    /// owned blocks are torn down unconditionally.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), GraphError> {
        let entry = self.node(node).ok_or(GraphError::StaleNode(node))?;
        for value in entry.outputs.iter() {
            let has_uses = self
                .values
                .get(*value)
                .map(|v| !v.uses.is_empty())
                .unwrap_or(false);
            if has_uses {
                return Err(GraphError::LiveUses {
                    node,
                    value: *value,
                });
            }
        }
        self.detach_node(node);
        Ok(())
    }

    fn detach_node(&mut self, node: NodeId) {
        let Some(entry) = self.nodes.get(node) else {
            return;
        };
        let owned: Vec<BlockId> = entry.blocks.iter().rev().copied().collect();
        for block in owned {
            self.detach_block(block);
        }
        let Some(entry) = self.nodes.remove(node) else {
            return;
        };
        for (operand, value) in entry.inputs.iter().enumerate() {
            self.drop_use(*value, Use::Node { node, operand });
        }
        for value in entry.outputs.iter() {
            self.values.remove(*value);
        }
        if let Some(block) = self.blocks.get_mut(entry.block) {
            block.nodes.retain(|candidate| *candidate != node);
        }
    }

    fn detach_block(&mut self, block: BlockId) {
        let Some(entry) = self.blocks.get(block) else {
            return;
        };
        let outputs = entry.outputs.clone();
        let nodes: Vec<NodeId> = entry.nodes.iter().rev().copied().collect();
        for (index, value) in outputs.into_iter().enumerate() {
            self.drop_use(value, Use::Return { block, index });
        }
        for node in nodes {
            self.detach_node(node);
        }
        if let Some(entry) = self.blocks.remove(block) {
            for param in entry.params {
                self.values.remove(param);
            }
        }
    }

    fn add_use(&mut self, value: ValueId, site: Use) {
        if let Some(entry) = self.values.get_mut(value) {
            entry.uses.push(site);
        }
    }

    fn drop_use(&mut self, value: ValueId, site: Use) {
        if let Some(entry) = self.values.get_mut(value) {
            if let Some(pos) = entry.uses.iter().position(|candidate| *candidate == site) {
                entry.uses.remove(pos);
            }
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id)
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    fn root_block(&self) -> &Block {
        self.blocks
            .get(self.root)
            .expect("root block is never removed")
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn contains_value(&self, id: ValueId) -> bool {
        self.values.contains_key(id)
    }

    pub fn kind(&self, node: NodeId) -> Option<&str> {
        self.node(node).map(Node::kind)
    }

    /// Node producing `value`, `None` for block parameters and stale handles.
    pub fn producer(&self, value: ValueId) -> Option<NodeId> {
        match self.value(value)?.def {
            ValueDef::NodeOutput { node, .. } => Some(node),
            ValueDef::BlockParam { .. } => None,
        }
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        self.value(value).map(Value::uses).unwrap_or(&[])
    }

    pub fn value_type(&self, value: ValueId) -> Option<&ValueType> {
        self.value(value).map(Value::ty)
    }

    pub fn set_value_type(&mut self, value: ValueId, ty: ValueType) -> Result<(), GraphError> {
        let entry = self
            .values
            .get_mut(value)
            .ok_or(GraphError::StaleValue(value))?;
        entry.ty = ty;
        Ok(())
    }

    pub fn value_name(&self, value: ValueId) -> Option<&str> {
        self.value(value).and_then(Value::name)
    }

    pub fn set_value_name(
        &mut self,
        value: ValueId,
        name: Option<String>,
    ) -> Result<(), GraphError> {
        let entry = self
            .values
            .get_mut(value)
            .ok_or(GraphError::StaleValue(value))?;
        entry.name = name;
        Ok(())
    }

    /// Redirects every use of `from` to `to`.
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) -> Result<(), GraphError> {
        self.replace_uses_with_except(from, to, &HashSet::new())
    }

    /// Redirects every use of `from` to `to`, except operands of nodes in `keep`.
    ///
    /// Block returns are always redirected.
    pub fn replace_uses_with_except(
        &mut self,
        from: ValueId,
        to: ValueId,
        keep: &HashSet<NodeId>,
    ) -> Result<(), GraphError> {
        if !self.contains_value(to) {
            return Err(GraphError::StaleValue(to));
        }
        let uses: Vec<Use> = self
            .value(from)
            .ok_or(GraphError::StaleValue(from))?
            .uses
            .to_vec();
        if from == to {
            return Ok(());
        }
        for site in uses {
            match site {
                Use::Node { node, operand } => {
                    if keep.contains(&node) {
                        continue;
                    }
                    if let Some(entry) = self.nodes.get_mut(node) {
                        entry.inputs[operand] = to;
                    }
                }
                Use::Return { block, index } => {
                    if let Some(entry) = self.blocks.get_mut(block) {
                        entry.outputs[index] = to;
                    }
                }
            }
            self.drop_use(from, site);
            self.add_use(to, site);
        }
        Ok(())
    }

    /// Nodes of `block` in execution order (empty for stale blocks).
    pub fn nodes_in_block(&self, block: BlockId) -> &[NodeId] {
        self.block(block).map(Block::nodes).unwrap_or(&[])
    }

    /// Every node, pre-order: a node precedes the contents of its blocks.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.node_count());
        self.walk_block(self.root, &mut order);
        order
    }

    fn walk_block(&self, block: BlockId, order: &mut Vec<NodeId>) {
        for node in self.nodes_in_block(block) {
            order.push(*node);
            if let Some(entry) = self.node(*node) {
                for inner in entry.blocks.iter() {
                    self.walk_block(*inner, order);
                }
            }
        }
    }

    /// Index of `node` inside its block.
    pub fn position(&self, node: NodeId) -> Option<usize> {
        let block = self.node(node)?.block;
        self.nodes_in_block(block)
            .iter()
            .position(|candidate| *candidate == node)
    }

    /// Returns `node` itself or its enclosing node that lives directly in `block`.
    pub fn ancestor_in_block(&self, node: NodeId, block: BlockId) -> Option<NodeId> {
        let mut current = node;
        loop {
            let entry = self.node(current)?;
            if entry.block == block {
                return Some(current);
            }
            current = self.block(entry.block)?.owner?;
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when `node` is a literal constant (`<ns>::Constant`).
    pub fn is_constant(&self, node: NodeId) -> bool {
        self.kind(node)
            .map(|kind| kind.rsplit("::").next() == Some("Constant"))
            .unwrap_or(false)
    }

    /// Literal held by the constant node producing `value`.
    pub fn constant_value(&self, value: ValueId) -> Option<&Literal> {
        let producer = self.producer(value)?;
        if !self.is_constant(producer) {
            return None;
        }
        self.node(producer)?.attr("value")
    }

    /// Checks def-before-use and scoping over the whole graph.
    pub fn validate(&self) -> Result<(), TopologyError> {
        validate_topology(self)
    }
}
