//! Pass ordering and model-type dispatch
//!
//! Each exporter family gets a fixed, ordered pass list from the
//! registry. Passes run exactly once each, in registration order, not
//! to a fixed point: later passes are designed to consume the output
//! shapes earlier passes produce (embedding fusion feeds the first
//! attention root; residual-normalization runs after attention has
//! collapsed the block it would otherwise see through).

use std::fmt;

use log::{debug, info};

use crate::error::FusionResult;
use crate::fusion::{
    FuseAttention, FuseEmbedLayerNorm, FuseGeluFamily, FuseSkipLayerNorm, FusionPass,
};
use crate::graph::GraphModel;
use crate::report::OptimizationReport;

/// Exporter-family key selecting the pass ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// Default transformer encoder export
    Bert,
    /// Alternate exporter convention (pre-norm, residual sum re-used)
    BertKeras,
    /// Autoregressive decoder-only export
    Gpt2,
}

impl ModelType {
    /// Key string as callers spell it
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Bert => "bert",
            ModelType::BertKeras => "bert_keras",
            ModelType::Gpt2 => "gpt2",
        }
    }

    /// Ordered pass list for this exporter family
    pub(crate) fn passes(&self) -> Vec<Box<dyn FusionPass>> {
        match self {
            ModelType::Bert => vec![
                Box::new(FuseEmbedLayerNorm::new()),
                Box::new(FuseAttention::new()),
                Box::new(FuseGeluFamily::new()),
                Box::new(FuseSkipLayerNorm::new()),
            ],
            ModelType::BertKeras => vec![
                Box::new(FuseEmbedLayerNorm::new()),
                Box::new(FuseAttention::new()),
                Box::new(FuseSkipLayerNorm::new()),
                Box::new(FuseGeluFamily::new()),
            ],
            ModelType::Gpt2 => vec![
                Box::new(FuseAttention::unidirectional()),
                Box::new(FuseGeluFamily::new()),
            ],
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied knobs for one pipeline run
///
/// `num_heads` and `hidden_size` describe the attention geometry; they
/// are not always recoverable from the graph alone, so the caller must
/// supply them. `use_gpu` selects the execution target and influences
/// only the activation-family pass's output op choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionOptions {
    /// Attention head count
    pub num_heads: usize,
    /// Model hidden dimension; must be a multiple of `num_heads`
    pub hidden_size: usize,
    /// Whether the fused graph targets the GPU execution path
    pub use_gpu: bool,
}

impl FusionOptions {
    /// Options for the CPU execution path
    pub fn new(num_heads: usize, hidden_size: usize) -> Self {
        Self { num_heads, hidden_size, use_gpu: false }
    }

    /// Select the execution target
    pub fn with_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }
}

/// Runs the registered pass sequence for one exporter family
#[derive(Debug, Default)]
pub struct FusionPipeline;

impl FusionPipeline {
    /// Optimize `model` in place and report on the result
    ///
    /// Validates the model first; a structural violation aborts with
    /// [`crate::error::FusionError::InvalidModel`] before any pass runs.
    /// Each registered pass then runs exactly once in order, and a final
    /// cleanup drops initializers left unreferenced by the rewrites.
    pub fn run(
        model_type: ModelType,
        model: &mut GraphModel,
        opts: &FusionOptions,
    ) -> FusionResult<OptimizationReport> {
        model.validate()?;

        let passes = model_type.passes();
        info!(
            "optimizing {} model: {} nodes, {} passes",
            model_type,
            model.node_count(),
            passes.len()
        );
        for pass in &passes {
            let stats = pass.run(model, opts)?;
            info!(
                "{}: fused {} subgraphs, removed {} nodes",
                pass.name(),
                stats.fused,
                stats.nodes_removed
            );
        }

        let pruned = model.prune_unreferenced_initializers();
        debug!("pruned {pruned} unreferenced initializers");

        Ok(OptimizationReport::collect(model, &passes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionError;
    use crate::graph::Node;
    use crate::op::OpType;
    use crate::testing::{bert_keras_model, bert_model, gpt2_model, BERT_HIDDEN, GPT2_HIDDEN, HEADS, LAYERS};

    fn assert_counts(report: &OptimizationReport, expected: &[(OpType, usize)]) {
        for (op, n) in expected {
            assert_eq!(report.count(op), *n, "count mismatch for {op}");
        }
    }

    #[test]
    fn test_bert_cpu_reference_counts() {
        let mut m = bert_model();
        let opts = FusionOptions::new(HEADS, BERT_HIDDEN);
        let report = FusionPipeline::run(ModelType::Bert, &mut m, &opts).unwrap();

        assert_counts(
            &report,
            &[
                (OpType::EmbedLayerNormalization, 1),
                (OpType::Attention, 12),
                (OpType::SkipLayerNormalization, 24),
                (OpType::BiasGelu, 12),
                (OpType::Gelu, 0),
                (OpType::FastGelu, 0),
                (OpType::LayerNormalization, 0),
            ],
        );
        assert!(report.is_fully_optimized());
    }

    #[test]
    fn test_bert_gpu_reference_counts() {
        let mut m = bert_model();
        let opts = FusionOptions::new(HEADS, BERT_HIDDEN).with_gpu(true);
        let report = FusionPipeline::run(ModelType::Bert, &mut m, &opts).unwrap();

        assert_counts(
            &report,
            &[
                (OpType::EmbedLayerNormalization, 1),
                (OpType::Attention, 12),
                (OpType::SkipLayerNormalization, 24),
                (OpType::FastGelu, 12),
                (OpType::BiasGelu, 0),
                (OpType::Gelu, 0),
            ],
        );
        assert!(report.is_fully_optimized());
    }

    #[test]
    fn test_bert_keras_reference_counts() {
        let mut m = bert_keras_model();
        let opts = FusionOptions::new(HEADS, BERT_HIDDEN);
        let report = FusionPipeline::run(ModelType::BertKeras, &mut m, &opts).unwrap();

        assert_counts(
            &report,
            &[
                (OpType::EmbedLayerNormalization, 1),
                (OpType::Attention, 12),
                (OpType::LayerNormalization, 24),
                (OpType::SkipLayerNormalization, 0),
                (OpType::BiasGelu, 12),
            ],
        );
        // Pre-norm residual re-use intentionally leaves the
        // normalization nodes standalone.
        assert!(!report.is_fully_optimized());
    }

    #[test]
    fn test_gpt2_reference_counts() {
        let mut m = gpt2_model(false);
        let opts = FusionOptions::new(HEADS, GPT2_HIDDEN);
        let report = FusionPipeline::run(ModelType::Gpt2, &mut m, &opts).unwrap();

        assert_counts(
            &report,
            &[
                (OpType::Attention, 12),
                (OpType::FastGelu, 12),
                (OpType::LayerNormalization, 25),
                (OpType::EmbedLayerNormalization, 0),
                (OpType::SkipLayerNormalization, 0),
            ],
        );
        assert!(report.is_fully_optimized());
    }

    #[test]
    fn test_gpt2_past_state_does_not_change_counts() {
        let opts = FusionOptions::new(HEADS, GPT2_HIDDEN);

        let mut without = gpt2_model(false);
        let report_without = FusionPipeline::run(ModelType::Gpt2, &mut without, &opts).unwrap();

        let mut with = gpt2_model(true);
        let report_with = FusionPipeline::run(ModelType::Gpt2, &mut with, &opts).unwrap();

        assert_eq!(report_without, report_with);
        // The present states are produced by the fused attention nodes.
        let present = with.tensor_id("l0_present_key").unwrap();
        let producer = with.producer_of(present).unwrap();
        assert_eq!(with.node(producer).op, OpType::Attention);
    }

    #[test]
    fn test_second_run_fuses_nothing() {
        let mut m = bert_model();
        let opts = FusionOptions::new(HEADS, BERT_HIDDEN);
        let first = FusionPipeline::run(ModelType::Bert, &mut m, &opts).unwrap();
        let nodes_after_first = m.node_count();

        let second = FusionPipeline::run(ModelType::Bert, &mut m, &opts).unwrap();
        assert_eq!(first, second);
        assert_eq!(m.node_count(), nodes_after_first);
    }

    #[test]
    fn test_identical_inputs_give_identical_reports() {
        let opts = FusionOptions::new(HEADS, BERT_HIDDEN);
        let mut a = bert_model();
        let mut b = bert_model();
        let ra = FusionPipeline::run(ModelType::Bert, &mut a, &opts).unwrap();
        let rb = FusionPipeline::run(ModelType::Bert, &mut b, &opts).unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_use_gpu_flips_only_the_gelu_family() {
        let opts_cpu = FusionOptions::new(HEADS, BERT_HIDDEN);
        let opts_gpu = opts_cpu.with_gpu(true);

        let mut cpu = bert_model();
        let mut gpu = bert_model();
        let rc = FusionPipeline::run(ModelType::Bert, &mut cpu, &opts_cpu).unwrap();
        let rg = FusionPipeline::run(ModelType::Bert, &mut gpu, &opts_gpu).unwrap();

        assert_eq!(rc.count(&OpType::Attention), LAYERS);
        assert_eq!(rg.count(&OpType::Attention), LAYERS);
        for (op, n) in rc.fused_counts() {
            if matches!(op, OpType::BiasGelu | OpType::FastGelu) {
                continue;
            }
            assert_eq!(rg.count(op), *n, "count changed under use_gpu for {op}");
        }
        assert_eq!(rc.count(&OpType::BiasGelu), rg.count(&OpType::FastGelu));
    }

    #[test]
    fn test_bad_geometry_leaves_attention_unfused() {
        let mut m = bert_model();
        let opts = FusionOptions::new(5, BERT_HIDDEN);
        let report = FusionPipeline::run(ModelType::Bert, &mut m, &opts).unwrap();

        assert_eq!(report.count(&OpType::Attention), 0);
        assert!(!report.is_fully_optimized());
        assert_eq!(m.count_of_type(&OpType::Softmax), LAYERS);
    }

    #[test]
    fn test_invalid_model_aborts_run() {
        let mut m = GraphModel::new(12, "test");
        let a = m.intern("a");
        let b = m.intern("b");
        m.add_node(Node::new(OpType::Erf).with_input(a).with_output(b))
            .unwrap();
        m.add_node(Node::new(OpType::Sqrt).with_input(b).with_output(a))
            .unwrap();

        let opts = FusionOptions::new(HEADS, BERT_HIDDEN);
        let err = FusionPipeline::run(ModelType::Bert, &mut m, &opts).unwrap_err();
        assert!(matches!(err, FusionError::InvalidModel(_)));
    }

    #[test]
    fn test_model_type_keys() {
        assert_eq!(ModelType::Bert.as_str(), "bert");
        assert_eq!(ModelType::BertKeras.as_str(), "bert_keras");
        assert_eq!(ModelType::Gpt2.as_str(), "gpt2");
        assert_eq!(ModelType::Gpt2.passes().len(), 2);
    }
}
