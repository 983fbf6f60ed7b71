//! Post-run statistics
//!
//! The report is plain data collected from the final graph: how many
//! fused nodes of each type the pipeline produced, and whether any raw
//! constituent material for the selected pipeline survived. Callers
//! inspect [`OptimizationReport::is_fully_optimized`] to detect
//! "successful run, but not everything fusable was fused"; that outcome
//! is not an error.

use std::collections::BTreeMap;

use crate::fusion::FusionPass;
use crate::graph::GraphModel;
use crate::op::{OpType, REPORTED_OPS};

/// Fused-operator statistics over the final graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizationReport {
    counts: BTreeMap<OpType, usize>,
    raw_remaining: usize,
}

impl OptimizationReport {
    /// Collect the report after the last pass has run
    ///
    /// `passes` is the pipeline's registered pass list; the union of
    /// their raw op types defines what counts as unfused material.
    pub(crate) fn collect(model: &GraphModel, passes: &[Box<dyn FusionPass>]) -> Self {
        let counts = REPORTED_OPS
            .iter()
            .map(|op| (op.clone(), model.count_of_type(op)))
            .collect();

        let mut raw_ops: Vec<&OpType> = Vec::new();
        let mut raw_remaining = 0;
        for pass in passes {
            for op in pass.raw_ops() {
                if !raw_ops.contains(&op) {
                    raw_ops.push(op);
                    raw_remaining += model.count_of_type(op);
                }
            }
        }

        Self { counts, raw_remaining }
    }

    /// Node counts per reported op type, in a deterministic order
    pub fn fused_counts(&self) -> &BTreeMap<OpType, usize> {
        &self.counts
    }

    /// Count for one reported op type
    pub fn count(&self, op: &OpType) -> usize {
        self.counts.get(op).copied().unwrap_or(0)
    }

    /// Whether no raw constituent idiom remains for the selected pipeline
    pub fn is_fully_optimized(&self) -> bool {
        self.raw_remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionResult;
    use crate::fusion::FusionStats;
    use crate::graph::Node;
    use crate::pipeline::FusionOptions;

    struct NoopPass(&'static [OpType]);

    impl FusionPass for NoopPass {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn raw_ops(&self) -> &'static [OpType] {
            self.0
        }
        fn run(&self, _: &mut GraphModel, _: &FusionOptions) -> FusionResult<FusionStats> {
            Ok(FusionStats::new())
        }
    }

    fn model_with(ops: &[OpType]) -> GraphModel {
        let mut m = GraphModel::new(12, "test");
        let mut prev = m.add_input("x");
        for (i, op) in ops.iter().enumerate() {
            let out = m.intern(format!("t{i}"));
            m.add_node(Node::new(op.clone()).with_input(prev).with_output(out))
                .unwrap();
            prev = out;
        }
        m
    }

    #[test]
    fn test_counts_cover_reported_ops() {
        let m = model_with(&[OpType::Attention, OpType::Attention, OpType::Gelu]);
        let passes: Vec<Box<dyn FusionPass>> = vec![Box::new(NoopPass(&[OpType::Softmax]))];
        let report = OptimizationReport::collect(&m, &passes);

        assert_eq!(report.count(&OpType::Attention), 2);
        assert_eq!(report.count(&OpType::Gelu), 1);
        assert_eq!(report.count(&OpType::FastGelu), 0);
        assert_eq!(report.fused_counts().len(), REPORTED_OPS.len());
        assert!(report.is_fully_optimized());
    }

    #[test]
    fn test_remaining_raw_material_fails_predicate() {
        let m = model_with(&[OpType::Attention, OpType::Softmax]);
        let passes: Vec<Box<dyn FusionPass>> = vec![Box::new(NoopPass(&[OpType::Softmax]))];
        let report = OptimizationReport::collect(&m, &passes);
        assert!(!report.is_fully_optimized());
    }

    #[test]
    fn test_raw_set_is_scoped_to_registered_passes() {
        // A leftover LayerNormalization only matters to pipelines that
        // register a pass consuming it.
        let m = model_with(&[OpType::LayerNormalization]);
        let without: Vec<Box<dyn FusionPass>> = vec![Box::new(NoopPass(&[OpType::Softmax]))];
        let with: Vec<Box<dyn FusionPass>> =
            vec![Box::new(NoopPass(&[OpType::LayerNormalization]))];

        assert!(OptimizationReport::collect(&m, &without).is_fully_optimized());
        assert!(!OptimizationReport::collect(&m, &with).is_fully_optimized());
    }
}
