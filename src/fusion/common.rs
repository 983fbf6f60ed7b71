//! Fusion pass contract and shared matching helpers

use rustc_hash::FxHashSet;

use crate::error::FusionResult;
use crate::graph::{GraphModel, Initializer, NodeId, TensorId};
use crate::op::OpType;
use crate::pipeline::FusionOptions;

/// One self-contained rewrite rule
///
/// A pass scans anchor nodes of a distinguishing op type, matches a
/// fixed-shape subgraph by walking producer/consumer edges a bounded
/// number of hops, and replaces each match atomically through
/// [`GraphModel::replace_subgraph`]. Mismatched anchors are left
/// untouched; only [`crate::error::FusionError::InvalidModel`] escapes
/// [`FusionPass::run`].
pub trait FusionPass {
    /// Pass name, used in log lines
    fn name(&self) -> &'static str;

    /// Raw constituent op types this pass consumes
    ///
    /// The report treats any remaining instance of these as "graph not
    /// fully optimized" for pipelines that register the pass.
    fn raw_ops(&self) -> &'static [OpType];

    /// Scan the whole graph once and fuse every match
    fn run(&self, model: &mut GraphModel, opts: &FusionOptions) -> FusionResult<FusionStats>;
}

/// Per-pass fusion statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FusionStats {
    /// Number of subgraphs replaced
    pub fused: usize,
    /// Number of raw nodes removed across all replacements
    pub nodes_removed: usize,
}

impl FusionStats {
    /// Empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful replacement
    pub fn record(&mut self, nodes_removed: usize) {
        self.fused += 1;
        self.nodes_removed += nodes_removed;
    }

    /// Accumulate another pass's statistics
    pub fn merge(&mut self, other: FusionStats) {
        self.fused += other.fused;
        self.nodes_removed += other.nodes_removed;
    }
}

/// The single consumer of `tensor`, if it exists and has the given op
pub(crate) fn sole_consumer_of_type(
    model: &GraphModel,
    tensor: TensorId,
    op: &OpType,
) -> Option<NodeId> {
    let id = model.single_consumer(tensor)?;
    (model.node(id).op == *op).then_some(id)
}

/// Whether `tensor` is a one-element float initializer near `value`
pub(crate) fn scalar_init_is(model: &GraphModel, tensor: TensorId, value: f32) -> bool {
    model
        .initializer(tensor)
        .and_then(Initializer::scalar_f32)
        .is_some_and(|v| (v - value).abs() <= 1e-3)
}

/// Whether every tensor produced inside `nodes` stays inside the set
///
/// Tensors listed in `reproduced` are exempt: the replacement node will
/// produce them again. Passes run this as the last structural check so
/// that [`GraphModel::replace_subgraph`] never has to reject a match.
pub(crate) fn outputs_contained(
    model: &GraphModel,
    nodes: &[NodeId],
    reproduced: &[TensorId],
) -> bool {
    let set: FxHashSet<NodeId> = nodes.iter().copied().collect();
    for &id in nodes {
        for &out in &model.node(id).outputs {
            if reproduced.contains(&out) {
                continue;
            }
            if model.is_graph_output(out) {
                return false;
            }
            if model.consumers_of(out).iter().any(|c| !set.contains(c)) {
                return false;
            }
        }
    }
    true
}
