//! In-memory graph model
//!
//! `GraphModel` owns the nodes, tensor names, and initializers of one
//! decoded model, together with the indices the fusion passes query:
//!
//! | Index | Description |
//! |-------|-------------|
//! | `producers` | tensor id → producing node, if any |
//! | `consumers` | tensor id → consuming nodes, one entry per use |
//! | `by_op`     | op type → node ids in insertion order |
//!
//! Indices are maintained eagerly by every mutation, so queries always
//! reflect the current graph. Passes borrow read access during matching
//! and request structural edits through the mutation API in
//! [`super::mutate`]; they never touch the collections directly.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{FusionError, FusionResult};
use crate::graph::node::{Node, NodeArena, NodeId};
use crate::graph::tensor::{Initializer, TensorId, TensorTable};
use crate::op::OpType;

/// Consumer list; most tensors have 1-4 consumers
pub(crate) type ConsumerList = SmallVec<[NodeId; 4]>;

/// One decoded model: graph plus read-only metadata
#[derive(Debug, Default)]
pub struct GraphModel {
    pub(crate) nodes: NodeArena,
    pub(crate) tensors: TensorTable,
    pub(crate) inits: FxHashMap<TensorId, Initializer>,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) producers: FxHashMap<TensorId, NodeId>,
    pub(crate) consumers: FxHashMap<TensorId, ConsumerList>,
    pub(crate) by_op: FxHashMap<OpType, Vec<NodeId>>,
    live_count: usize,
    opset_version: i64,
    producer_tag: String,
}

impl GraphModel {
    /// Create an empty model with the given metadata
    pub fn new(opset_version: i64, producer_tag: impl Into<String>) -> Self {
        Self {
            opset_version,
            producer_tag: producer_tag.into(),
            ..Default::default()
        }
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Operator-set version of the source model
    pub fn opset_version(&self) -> i64 {
        self.opset_version
    }

    /// Producer tag of the source model
    pub fn producer_tag(&self) -> &str {
        &self.producer_tag
    }

    // ========================================================================
    // Construction (used by the external decoder and by tests)
    // ========================================================================

    /// Intern a tensor name
    pub fn intern(&mut self, name: impl AsRef<str>) -> TensorId {
        self.tensors.intern(name)
    }

    /// Resolve a tensor id back to its name
    pub fn tensor_name(&self, id: TensorId) -> &str {
        self.tensors.name(id)
    }

    /// Look up a tensor name without interning
    pub fn tensor_id(&self, name: &str) -> Option<TensorId> {
        self.tensors.get(name)
    }

    /// Declare a graph input
    pub fn add_input(&mut self, name: impl AsRef<str>) -> TensorId {
        let id = self.tensors.intern(name);
        self.inputs.push(id);
        id
    }

    /// Declare a graph output
    pub fn add_output(&mut self, name: impl AsRef<str>) -> TensorId {
        let id = self.tensors.intern(name);
        self.outputs.push(id);
        id
    }

    /// Add a constant tensor owned by the graph
    pub fn add_initializer(&mut self, init: Initializer) -> FusionResult<TensorId> {
        init.check()?;
        let id = self.tensors.intern(&init.name);
        if self.producers.contains_key(&id) {
            return Err(FusionError::InvalidModel(format!(
                "tensor '{}' is both an initializer and a node output",
                init.name
            )));
        }
        if self.inits.contains_key(&id) {
            return Err(FusionError::InvalidModel(format!(
                "duplicate initializer '{}'",
                init.name
            )));
        }
        self.inits.insert(id, init);
        Ok(id)
    }

    /// Add a node, updating all indices
    ///
    /// Fails with [`FusionError::InvalidModel`] if any output tensor
    /// already has a producer or names an initializer.
    pub fn add_node(&mut self, node: Node) -> FusionResult<NodeId> {
        for &out in &node.outputs {
            if self.producers.contains_key(&out) {
                return Err(FusionError::InvalidModel(format!(
                    "tensor '{}' produced by more than one node",
                    self.tensors.name(out)
                )));
            }
            if self.inits.contains_key(&out) {
                return Err(FusionError::InvalidModel(format!(
                    "tensor '{}' is an initializer and cannot be produced",
                    self.tensors.name(out)
                )));
            }
        }

        let op = node.op.clone();
        let inputs = node.inputs.clone();
        let outputs = node.outputs.clone();
        let id = self.nodes.alloc(node);

        for &out in &outputs {
            self.producers.insert(out, id);
        }
        for &inp in &inputs {
            self.consumers.entry(inp).or_default().push(id);
        }
        self.by_op.entry(op).or_default().push(id);
        self.live_count += 1;
        Ok(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Borrow a node
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// All live nodes of the given op type, in insertion order
    ///
    /// O(1) amortized via the maintained op-type index; reflects all
    /// prior mutations. Returns an owned list so callers may mutate the
    /// graph while walking it.
    pub fn nodes_of_type(&self, op: &OpType) -> Vec<NodeId> {
        self.by_op
            .get(op)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|&id| !self.nodes[id].deleted)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live nodes of the given op type
    pub fn count_of_type(&self, op: &OpType) -> usize {
        self.by_op
            .get(op)
            .map(|ids| ids.iter().filter(|&&id| !self.nodes[id].deleted).count())
            .unwrap_or(0)
    }

    /// The unique node producing a tensor, or `None` for graph inputs
    /// and initializers
    pub fn producer_of(&self, tensor: TensorId) -> Option<NodeId> {
        self.producers.get(&tensor).copied()
    }

    /// All nodes reading a tensor, one entry per use
    pub fn consumers_of(&self, tensor: TensorId) -> &[NodeId] {
        self.consumers
            .get(&tensor)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The sole consumer of a tensor, if it has exactly one
    pub fn single_consumer(&self, tensor: TensorId) -> Option<NodeId> {
        match self.consumers_of(tensor) {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Whether a tensor is a declared graph input
    pub fn is_graph_input(&self, tensor: TensorId) -> bool {
        self.inputs.contains(&tensor)
    }

    /// Whether a tensor is a declared graph output
    pub fn is_graph_output(&self, tensor: TensorId) -> bool {
        self.outputs.contains(&tensor)
    }

    /// Whether a tensor names an initializer
    pub fn is_initializer(&self, tensor: TensorId) -> bool {
        self.inits.contains_key(&tensor)
    }

    /// Borrow an initializer by tensor id
    pub fn initializer(&self, tensor: TensorId) -> Option<&Initializer> {
        self.inits.get(&tensor)
    }

    /// Declared graph inputs
    pub fn graph_inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// Declared graph outputs
    pub fn graph_outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Number of live nodes
    pub fn node_count(&self) -> usize {
        self.live_count
    }

    /// Number of initializers
    pub fn initializer_count(&self) -> usize {
        self.inits.len()
    }

    /// Iterate over live nodes in arena order
    pub fn iter_live(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().filter(|(_, n)| !n.deleted)
    }

    pub(crate) fn bump_live(&mut self, delta: isize) {
        self.live_count = (self.live_count as isize + delta) as usize;
    }
}
