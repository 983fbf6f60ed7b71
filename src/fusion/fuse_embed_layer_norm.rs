//! Embedding-normalization fusion
//!
//! Matches the word/position/segment lookup chain feeding an encoder's
//! first normalization:
//!
//! ```text
//! Gather(word)  Gather(position)
//!        \       /
//!          Add        Gather(segment)
//!            \         /
//!              Add
//!               |
//!       LayerNormalization
//! ```
//!
//! and replaces it with one `EmbedLayerNormalization` node carrying the
//! three tables and the normalization scale/bias. The position-id
//! sequence is recomputed by the fused kernel, so its lookup indices do
//! not survive as an input.

use log::debug;

use crate::error::FusionResult;
use crate::graph::{GraphModel, Node, NodeId, TensorId};
use crate::op::OpType;
use crate::pipeline::FusionOptions;

use super::common::{outputs_contained, FusionPass, FusionStats};

/// Matched lookup chain around one normalization anchor
struct EmbedMatch {
    input_ids: TensorId,
    segment_ids: TensorId,
    word_table: TensorId,
    position_table: TensorId,
    segment_table: TensorId,
    gamma: TensorId,
    beta: TensorId,
    epsilon: Option<f32>,
    out: TensorId,
    nodes: Vec<NodeId>,
}

/// One embedding lookup: `Gather(table, indices)`
struct Lookup {
    node: NodeId,
    table: TensorId,
    indices: TensorId,
}

/// Fuses the embedding lookup chain with its normalization
#[derive(Debug, Default)]
pub struct FuseEmbedLayerNorm;

impl FuseEmbedLayerNorm {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Parse one `Gather` over an initializer-backed embedding table
    fn lookup(&self, model: &GraphModel, tensor: TensorId) -> Option<Lookup> {
        let node_id = model.producer_of(tensor)?;
        let node = model.node(node_id);
        if node.op != OpType::Gather || node.inputs.len() != 2 {
            return None;
        }
        let table = node.inputs[0];
        model
            .initializer(table)
            .filter(|init| init.dims.len() == 2)?;
        Some(Lookup {
            node: node_id,
            table,
            indices: node.inputs[1],
        })
    }

    fn match_anchor(&self, model: &GraphModel, ln_id: NodeId) -> Option<EmbedMatch> {
        let ln = model.node(ln_id);
        if ln.inputs.len() < 3 {
            return None;
        }
        let (sum, gamma, beta) = (ln.inputs[0], ln.inputs[1], ln.inputs[2]);
        if !model.is_initializer(gamma) || !model.is_initializer(beta) {
            return None;
        }

        // The outer summation adds the segment lookup to the word+position
        // sum; it must feed the anchor alone.
        if model.single_consumer(sum)? != ln_id {
            return None;
        }
        let outer_id = model.producer_of(sum)?;
        let outer = model.node(outer_id);
        if outer.op != OpType::Add || outer.inputs.len() != 2 {
            return None;
        }

        let inner_of = |t: TensorId| {
            model
                .producer_of(t)
                .filter(|&p| model.node(p).op == OpType::Add)
        };
        let (inner_id, segment) = match (inner_of(outer.inputs[0]), inner_of(outer.inputs[1])) {
            (Some(inner), None) => (inner, self.lookup(model, outer.inputs[1])?),
            (None, Some(inner)) => (inner, self.lookup(model, outer.inputs[0])?),
            _ => return None,
        };
        let inner = model.node(inner_id);
        if inner.inputs.len() != 2 {
            return None;
        }
        if model.single_consumer(inner.outputs[0])? != outer_id {
            return None;
        }

        let first = self.lookup(model, inner.inputs[0])?;
        let second = self.lookup(model, inner.inputs[1])?;

        // The word lookup reads the graph's token ids; the position lookup
        // reads a constant id sequence baked in by the exporter.
        let (word, position) = if model.is_graph_input(first.indices)
            && model.is_initializer(second.indices)
        {
            (first, second)
        } else if model.is_graph_input(second.indices) && model.is_initializer(first.indices) {
            (second, first)
        } else {
            return None;
        };
        if !model.is_graph_input(segment.indices) {
            return None;
        }

        // No lookup output may fan out past its summation.
        for lookup in [&word, &position, &segment] {
            let out = model.node(lookup.node).outputs[0];
            model.single_consumer(out)?;
        }

        let nodes = vec![word.node, position.node, segment.node, inner_id, outer_id, ln_id];
        let out = ln.outputs[0];
        if !outputs_contained(model, &nodes, &[out]) {
            return None;
        }

        Some(EmbedMatch {
            input_ids: word.indices,
            segment_ids: segment.indices,
            word_table: word.table,
            position_table: position.table,
            segment_table: segment.table,
            gamma,
            beta,
            epsilon: ln.attr_f("epsilon"),
            out,
            nodes,
        })
    }
}

impl FusionPass for FuseEmbedLayerNorm {
    fn name(&self) -> &'static str {
        "embed_layer_norm"
    }

    fn raw_ops(&self) -> &'static [OpType] {
        &[OpType::Gather]
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

            let mut fused = Node::new(OpType::EmbedLayerNormalization)
                .with_name(format!("embed_layer_norm_{}", stats.fused))
                .with_inputs(vec![
                    m.input_ids,
                    m.segment_ids,
                    m.word_table,
                    m.position_table,
                    m.segment_table,
                    m.gamma,
                    m.beta,
                ])
                .with_output(m.out);
            if let Some(eps) = m.epsilon {
                fused = fused.with_attr_f("epsilon", eps);
            }

            model.replace_subgraph(&m.nodes, fused, vec![])?;
            debug!(
                "embed_layer_norm: fused lookup chain into '{}'",
                model.tensor_name(m.out)
            );
            stats.record(m.nodes.len());
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Initializer;
    use crate::testing::bert_embedding;

    fn embedding_model() -> GraphModel {
        let mut m = GraphModel::new(12, "test");
        let out = bert_embedding(&mut m);
        let name = m.tensor_name(out).to_string();
        m.add_output(name);
        m
    }

    fn opts() -> FusionOptions {
        FusionOptions::new(2, 8)
    }

    #[test]
    fn test_fuses_three_lookup_chain() {
        let mut m = embedding_model();
        let stats = FuseEmbedLayerNorm::new().run(&mut m, &opts()).unwrap();

        assert_eq!(stats.fused, 1);
        assert_eq!(stats.nodes_removed, 6);
        assert_eq!(m.count_of_type(&OpType::EmbedLayerNormalization), 1);
        assert_eq!(m.count_of_type(&OpType::Gather), 0);
        assert_eq!(m.count_of_type(&OpType::Add), 0);
        assert_eq!(m.count_of_type(&OpType::LayerNormalization), 0);

        let fused = m.nodes_of_type(&OpType::EmbedLayerNormalization)[0];
        let node = m.node(fused);
        assert_eq!(node.inputs.len(), 7);
        assert_eq!(node.inputs[0], m.tensor_id("input_ids").unwrap());
        assert_eq!(node.inputs[1], m.tensor_id("segment_ids").unwrap());
        assert_eq!(node.inputs[2], m.tensor_id("word_table").unwrap());

        // The constant position ids lost their only reader.
        let pos_ids = m.tensor_id("position_ids").unwrap();
        assert!(!m.is_initializer(pos_ids));
    }

    #[test]
    fn test_intermediate_fan_out_blocks_fusion() {
        let mut m = embedding_model();
        let inner = m.tensor_id("embed_sum_wp").unwrap();
        let tap = m.intern("tap");
        m.add_node(Node::new(OpType::Identity).with_input(inner).with_output(tap))
            .unwrap();

        let stats = FuseEmbedLayerNorm::new().run(&mut m, &opts()).unwrap();
        assert_eq!(stats.fused, 0);
        assert_eq!(m.count_of_type(&OpType::Gather), 3);
    }

    #[test]
    fn test_two_lookup_chain_does_not_match() {
        // Decoder-style embedding: word + position only, no segment.
        let mut m = GraphModel::new(12, "test");
        let ids = m.add_input("ids");
        let wte = m
            .add_initializer(Initializer::f32("wte", vec![4, 8], vec![0.0; 32]))
            .unwrap();
        let pos_ids = m
            .add_initializer(Initializer::i64("pos_ids", vec![3], vec![0, 1, 2]))
            .unwrap();
        let wpe = m
            .add_initializer(Initializer::f32("wpe", vec![4, 8], vec![0.0; 32]))
            .unwrap();
        let gamma = m
            .add_initializer(Initializer::f32("gamma", vec![8], vec![1.0; 8]))
            .unwrap();
        let beta = m
            .add_initializer(Initializer::f32("beta", vec![8], vec![0.0; 8]))
            .unwrap();

        let tok = m.intern("tok");
        let pos = m.intern("pos");
        let sum = m.intern("sum");
        let out = m.add_output("out");
        m.add_node(Node::new(OpType::Gather).with_input(wte).with_input(ids).with_output(tok))
            .unwrap();
        m.add_node(
            Node::new(OpType::Gather)
                .with_input(wpe)
                .with_input(pos_ids)
                .with_output(pos),
        )
        .unwrap();
        m.add_node(Node::new(OpType::Add).with_input(tok).with_input(pos).with_output(sum))
            .unwrap();
        m.add_node(
            Node::new(OpType::LayerNormalization)
                .with_input(sum)
                .with_input(gamma)
                .with_input(beta)
                .with_output(out),
        )
        .unwrap();

        let stats = FuseEmbedLayerNorm::new().run(&mut m, &opts()).unwrap();
        assert_eq!(stats.fused, 0);
    }
}
