//! Graph mutation operations
//!
//! Structural edits requested by the fusion passes. All index updates
//! happen inside this module; [`GraphModel::replace_subgraph`] is
//! check-then-commit, so a rejected replacement leaves the graph
//! untouched.

use rustc_hash::FxHashSet;

use crate::error::{FusionError, FusionResult};
use crate::graph::model::GraphModel;
use crate::graph::node::{Node, NodeId};
use crate::graph::tensor::{Initializer, TensorId};

impl GraphModel {
    /// Atomically replace a matched subgraph with one fused node
    ///
    /// Removes `old` and any initializers that become unreferenced,
    /// inserts `new_inits` and `new_node`, and updates every index.
    ///
    /// Every output of `old` that is consumed outside the set, or is a
    /// declared graph output, must appear among `new_node`'s outputs;
    /// otherwise the replacement would orphan a live tensor and the call
    /// fails with [`FusionError::InvalidModel`] without mutating
    /// anything. Callers are expected to have verified this during
    /// matching, so a failure here indicates a pass bug, not an
    /// unfusable graph.
    pub fn replace_subgraph(
        &mut self,
        old: &[NodeId],
        new_node: Node,
        new_inits: Vec<Initializer>,
    ) -> FusionResult<NodeId> {
        let old_set: FxHashSet<NodeId> = old.iter().copied().collect();

        for &id in old {
            if self.nodes[id].deleted {
                return Err(FusionError::InvalidModel(
                    "replace_subgraph: node already removed".to_string(),
                ));
            }
        }

        // Phase 1: verify the external data-flow contract before touching
        // any index.
        let new_outputs: FxHashSet<TensorId> = new_node.outputs.iter().copied().collect();
        for &id in old {
            for &out in &self.nodes[id].outputs {
                let escapes = self.is_graph_output(out)
                    || self
                        .consumers_of(out)
                        .iter()
                        .any(|c| !old_set.contains(c));
                if escapes && !new_outputs.contains(&out) {
                    return Err(FusionError::InvalidModel(format!(
                        "replace_subgraph would orphan tensor '{}'",
                        self.tensor_name(out)
                    )));
                }
            }
        }
        for &out in &new_node.outputs {
            let producer_outside = self
                .producer_of(out)
                .is_some_and(|p| !old_set.contains(&p));
            if producer_outside {
                return Err(FusionError::InvalidModel(format!(
                    "tensor '{}' produced by more than one node",
                    self.tensor_name(out)
                )));
            }
            if self.is_initializer(out) {
                return Err(FusionError::InvalidModel(format!(
                    "tensor '{}' is an initializer and cannot be produced",
                    self.tensor_name(out)
                )));
            }
        }
        for init in &new_inits {
            init.check()?;
            if let Some(id) = self.tensors.get(&init.name) {
                let clashes = self.inits.contains_key(&id)
                    || new_outputs.contains(&id)
                    || self.producer_of(id).is_some_and(|p| !old_set.contains(&p));
                if clashes {
                    return Err(FusionError::InvalidModel(format!(
                        "replacement initializer '{}' collides with an existing tensor",
                        init.name
                    )));
                }
            }
        }

        // Phase 2: commit. Unlink the old nodes, then insert.
        let mut candidate_inits: FxHashSet<TensorId> = FxHashSet::default();
        for &id in old {
            for &inp in &self.nodes[id].inputs.clone() {
                if self.is_initializer(inp) {
                    candidate_inits.insert(inp);
                }
            }
            self.unlink_node(id);
        }

        for init in new_inits {
            let id = self.add_initializer(init)?;
            candidate_inits.remove(&id);
        }
        let new_id = self.add_node(new_node)?;

        for t in candidate_inits {
            if self.consumers_of(t).is_empty() && !self.is_graph_output(t) {
                self.inits.remove(&t);
            }
        }

        Ok(new_id)
    }

    /// Remove one node from every index and mark it deleted
    pub(crate) fn unlink_node(&mut self, id: NodeId) {
        let (inputs, outputs, op) = {
            let node = &self.nodes[id];
            (node.inputs.clone(), node.outputs.clone(), node.op.clone())
        };

        for &out in &outputs {
            self.producers.remove(&out);
        }
        for &inp in &inputs {
            if let Some(list) = self.consumers.get_mut(&inp) {
                if let Some(pos) = list.iter().position(|&n| n == id) {
                    list.remove(pos);
                }
            }
        }
        if let Some(ids) = self.by_op.get_mut(&op) {
            ids.retain(|&n| n != id);
        }

        self.nodes[id].deleted = true;
        self.bump_live(-1);
    }

    /// Drop initializers referenced by no node
    ///
    /// Run once after the last pass; returns the number removed.
    pub fn prune_unreferenced_initializers(&mut self) -> usize {
        let unreferenced: Vec<TensorId> = self
            .inits
            .keys()
            .copied()
            .filter(|&t| self.consumers_of(t).is_empty() && !self.is_graph_output(t))
            .collect();
        let count = unreferenced.len();
        for t in unreferenced {
            self.inits.remove(&t);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpType;

    /// x -> Div -> Erf -> y, with a scalar divisor initializer
    fn erf_chain() -> GraphModel {
        let mut m = GraphModel::new(11, "test");
        let x = m.add_input("x");
        let sqrt2 = m
            .add_initializer(Initializer::scalar("sqrt2", std::f32::consts::SQRT_2))
            .unwrap();
        let div_out = m.intern("div_out");
        let y = m.add_output("y");

        m.add_node(
            Node::new(OpType::Div)
                .with_name("div_0")
                .with_input(x)
                .with_input(sqrt2)
                .with_output(div_out),
        )
        .unwrap();
        m.add_node(
            Node::new(OpType::Erf)
                .with_name("erf_0")
                .with_input(div_out)
                .with_output(y),
        )
        .unwrap();
        m
    }

    #[test]
    fn test_replace_subgraph_rewires_indices() {
        let mut m = erf_chain();
        let x = m.tensor_id("x").unwrap();
        let y = m.tensor_id("y").unwrap();
        let div = m.producer_of(m.tensor_id("div_out").unwrap()).unwrap();
        let erf = m.producer_of(y).unwrap();

        let fused = Node::new(OpType::Gelu)
            .with_name("gelu_0")
            .with_input(x)
            .with_output(y);
        let id = m.replace_subgraph(&[div, erf], fused, vec![]).unwrap();

        assert_eq!(m.node_count(), 1);
        assert_eq!(m.producer_of(y), Some(id));
        assert_eq!(m.consumers_of(x), &[id]);
        assert!(m.nodes_of_type(&OpType::Div).is_empty());
        assert!(m.nodes_of_type(&OpType::Erf).is_empty());
        assert_eq!(m.nodes_of_type(&OpType::Gelu), vec![id]);
        // The divisor lost its last consumer and went with the subgraph.
        assert!(m.tensor_id("sqrt2").map(|t| !m.is_initializer(t)).unwrap());
    }

    #[test]
    fn test_replace_subgraph_rejects_orphaning() {
        let mut m = erf_chain();
        let x = m.tensor_id("x").unwrap();
        let div_out = m.tensor_id("div_out").unwrap();
        let y = m.tensor_id("y").unwrap();
        let div = m.producer_of(div_out).unwrap();

        // A second consumer of div_out outside the replaced set.
        let extra_out = m.intern("extra_out");
        m.add_node(
            Node::new(OpType::Identity)
                .with_input(div_out)
                .with_output(extra_out),
        )
        .unwrap();

        let fused = Node::new(OpType::Gelu).with_input(x).with_output(y);
        let err = m.replace_subgraph(&[div], fused, vec![]).unwrap_err();
        assert!(matches!(err, FusionError::InvalidModel(_)));

        // Check-then-commit: nothing changed.
        assert_eq!(m.node_count(), 3);
        assert_eq!(m.producer_of(div_out), Some(div));
        assert_eq!(m.nodes_of_type(&OpType::Div).len(), 1);
    }

    #[test]
    fn test_replace_subgraph_keeps_shared_initializer() {
        let mut m = erf_chain();
        let x = m.tensor_id("x").unwrap();
        let y = m.tensor_id("y").unwrap();
        let sqrt2 = m.tensor_id("sqrt2").unwrap();
        let div = m.producer_of(m.tensor_id("div_out").unwrap()).unwrap();
        let erf = m.producer_of(y).unwrap();

        // Another user of the same constant, outside the replaced set.
        let other_out = m.intern("other_out");
        m.add_node(
            Node::new(OpType::Div)
                .with_input(x)
                .with_input(sqrt2)
                .with_output(other_out),
        )
        .unwrap();

        let fused = Node::new(OpType::Gelu).with_input(x).with_output(y);
        m.replace_subgraph(&[div, erf], fused, vec![]).unwrap();

        assert!(m.is_initializer(sqrt2));
    }

    #[test]
    fn test_replace_subgraph_adds_new_initializers() {
        let mut m = erf_chain();
        let x = m.tensor_id("x").unwrap();
        let y = m.tensor_id("y").unwrap();
        let div = m.producer_of(m.tensor_id("div_out").unwrap()).unwrap();
        let erf = m.producer_of(y).unwrap();

        let bias = m.intern("packed_bias");
        let fused = Node::new(OpType::FastGelu)
            .with_input(x)
            .with_input(bias)
            .with_output(y);
        m.replace_subgraph(
            &[div, erf],
            fused,
            vec![Initializer::f32("packed_bias", vec![4], vec![0.0; 4])],
        )
        .unwrap();

        assert!(m.is_initializer(bias));
        assert_eq!(m.initializer_count(), 1); // sqrt2 pruned, packed_bias added
    }

    #[test]
    fn test_replace_subgraph_rejects_bad_initializer_before_commit() {
        let mut m = erf_chain();
        let x = m.tensor_id("x").unwrap();
        let y = m.tensor_id("y").unwrap();
        let div = m.producer_of(m.tensor_id("div_out").unwrap()).unwrap();
        let erf = m.producer_of(y).unwrap();

        let bias = m.intern("packed_bias");
        let fused = Node::new(OpType::FastGelu)
            .with_input(x)
            .with_input(bias)
            .with_output(y);
        // Dims say 4 elements, payload has 5.
        let err = m
            .replace_subgraph(
                &[div, erf],
                fused,
                vec![Initializer::f32("packed_bias", vec![4], vec![0.0; 5])],
            )
            .unwrap_err();
        assert!(matches!(err, FusionError::InvalidModel(_)));

        // Nothing committed.
        assert_eq!(m.node_count(), 2);
        assert_eq!(m.producer_of(y), Some(erf));
        assert!(m.is_initializer(m.tensor_id("sqrt2").unwrap()));
        assert!(!m.is_initializer(bias));
    }

    #[test]
    fn test_prune_unreferenced_initializers() {
        let mut m = erf_chain();
        m.add_initializer(Initializer::scalar("unused", 1.0)).unwrap();
        assert_eq!(m.initializer_count(), 2);

        let removed = m.prune_unreferenced_initializers();
        assert_eq!(removed, 1);
        assert_eq!(m.initializer_count(), 1);
        assert!(m.is_initializer(m.tensor_id("sqrt2").unwrap()));
    }
}
