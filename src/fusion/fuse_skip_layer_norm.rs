//! Residual-normalization fusion
//!
//! Matches `Add(branch, residual) -> LayerNormalization` and replaces
//! the pair with one `SkipLayerNormalization` node. The sum must feed
//! the normalization alone: pre-norm exporter variants re-use the
//! residual sum downstream, and those normalization nodes legitimately
//! stay standalone through a full pipeline run.

use log::debug;

use crate::error::FusionResult;
use crate::graph::{GraphModel, Node, NodeId, TensorId};
use crate::op::OpType;
use crate::pipeline::FusionOptions;

use super::common::{outputs_contained, FusionPass, FusionStats};

struct SkipMatch {
    input: TensorId,
    skip: TensorId,
    gamma: TensorId,
    beta: TensorId,
    epsilon: Option<f32>,
    out: TensorId,
    nodes: Vec<NodeId>,
}

/// Fuses a residual addition with the normalization it feeds
#[derive(Debug, Default)]
pub struct FuseSkipLayerNorm;

impl FuseSkipLayerNorm {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    fn match_anchor(&self, model: &GraphModel, ln_id: NodeId) -> Option<SkipMatch> {
        let ln = model.node(ln_id);
        if ln.inputs.len() < 3 {
            return None;
        }
        let (sum, gamma, beta) = (ln.inputs[0], ln.inputs[1], ln.inputs[2]);
        if !model.is_initializer(gamma) || !model.is_initializer(beta) {
            return None;
        }

        let add_id = model.producer_of(sum)?;
        let add = model.node(add_id);
        if add.op != OpType::Add || add.inputs.len() != 2 {
            return None;
        }
        // Both operands are activations; a constant operand is a bias
        // add, not a residual connection.
        if model.is_initializer(add.inputs[0]) || model.is_initializer(add.inputs[1]) {
            return None;
        }
        // The sum must have no external fan-out.
        if model.single_consumer(sum)? != ln_id {
            return None;
        }

        let nodes = vec![add_id, ln_id];
        let out = ln.outputs[0];
        if !outputs_contained(model, &nodes, &[out]) {
            return None;
        }

        Some(SkipMatch {
            input: add.inputs[0],
            skip: add.inputs[1],
            gamma,
            beta,
            epsilon: ln.attr_f("epsilon"),
            out,
            nodes,
        })
    }
}

impl FusionPass for FuseSkipLayerNorm {
    fn name(&self) -> &'static str {
        "skip_layer_norm"
    }

    fn raw_ops(&self) -> &'static [OpType] {
        &[OpType::LayerNormalization]
    }

    fn run(&self, model: &mut GraphModel, _opts: &FusionOptions) -> FusionResult<FusionStats> {
        let mut stats = FusionStats::new();
        for ln_id in model.nodes_of_type(&OpType::LayerNormalization) {
            if model.node(ln_id).is_deleted() {
                continue;
            }
            let Some(m) = self.match_anchor(model, ln_id) else {
                continue;
            };

            let mut fused = Node::new(OpType::SkipLayerNormalization)
                .with_name(format!("skip_layer_norm_{}", stats.fused))
                .with_inputs(vec![m.input, m.skip, m.gamma, m.beta])
                .with_output(m.out);
            if let Some(eps) = m.epsilon {
                fused = fused.with_attr_f("epsilon", eps);
            }

            model.replace_subgraph(&m.nodes, fused, vec![])?;
            debug!(
                "skip_layer_norm: fused residual sum into '{}'",
                model.tensor_name(m.out)
            );
            stats.record(m.nodes.len());
        }
        Ok(stats)
    }
}
