//! Topological ordering and structural validation

use rustc_hash::FxHashMap;

use crate::error::{FusionError, FusionResult};
use crate::graph::model::GraphModel;
use crate::graph::node::NodeId;

impl GraphModel {
    /// Live nodes in data-flow order
    ///
    /// Kahn's algorithm seeded from nodes whose every input is a graph
    /// input, an initializer, or absent. Fails with
    /// [`FusionError::InvalidModel`] if the reference structure contains
    /// a cycle.
    pub fn topological_order(&self) -> FusionResult<Vec<NodeId>> {
        let mut indegree: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut queue: Vec<NodeId> = Vec::new();

        for (id, node) in self.iter_live() {
            let deps = node
                .inputs
                .iter()
                .filter(|&&t| {
                    self.producer_of(t)
                        .is_some_and(|p| !self.node(p).is_deleted())
                })
                .count();
            indegree.insert(id, deps);
            if deps == 0 {
                queue.push(id);
            }
        }

        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = queue.pop() {
            order.push(id);
            for &out in &self.node(id).outputs {
                for &consumer in self.consumers_of(out) {
                    if let Some(deg) = indegree.get_mut(&consumer) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push(consumer);
                        }
                    }
                }
            }
        }

        if order.len() != self.node_count() {
            return Err(FusionError::InvalidModel(
                "graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// Check the graph's structural contract
    ///
    /// Every consumed tensor must be a graph input, an initializer, or
    /// produced in-graph; every declared output must resolve the same
    /// way; the reference structure must be acyclic. Duplicate producers
    /// are already rejected at construction.
    pub fn validate(&self) -> FusionResult<()> {
        for (_, node) in self.iter_live() {
            for &inp in &node.inputs {
                let known = self.is_graph_input(inp)
                    || self.is_initializer(inp)
                    || self.producer_of(inp).is_some();
                if !known {
                    return Err(FusionError::InvalidModel(format!(
                        "node '{}' consumes dangling tensor '{}'",
                        node.name.as_deref().unwrap_or("<unnamed>"),
                        self.tensor_name(inp)
                    )));
                }
            }
        }
        for &out in self.graph_outputs() {
            let known = self.is_graph_input(out)
                || self.is_initializer(out)
                || self.producer_of(out).is_some();
            if !known {
                return Err(FusionError::InvalidModel(format!(
                    "graph output '{}' is not produced",
                    self.tensor_name(out)
                )));
            }
        }
        self.topological_order().map(|_| ())
    }
}
