//! Delegation to a framework-native optimizer
//!
//! An independent entry point that hands the entire optimization to the
//! serving framework's own optimizer instead of running the pass
//! pipeline. The collaborator is an opaque blocking black box reached
//! through [`NativeOptimizer`]; its internal pass set may differ from
//! ours (for example, choosing `FastGelu` where the pipeline would pick
//! `BiasGelu`), so the contract is "equivalent but not necessarily
//! identical output".

use std::path::Path;

use log::info;

use crate::error::{FusionError, FusionResult};

/// Opaque framework-native optimizer
pub trait NativeOptimizer {
    /// Optimize the model file at `input`, writing the result to `output`
    fn optimize(&self, input: &Path, use_gpu: bool, output: &Path) -> FusionResult<()>;
}

/// Optimize a model file through a framework-native optimizer
///
/// Checks that `input` exists, invokes the collaborator, and verifies
/// that it actually wrote `output`. A missing result file surfaces as
/// [`FusionError::NativeOptimizer`] even when the collaborator reported
/// success.
pub fn optimize_by_native(
    native: &dyn NativeOptimizer,
    input: &Path,
    use_gpu: bool,
    output: &Path,
) -> FusionResult<()> {
    if !input.is_file() {
        return Err(FusionError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("model file '{}' not found", input.display()),
        )));
    }

    info!(
        "delegating optimization of '{}' to the native optimizer (use_gpu={use_gpu})",
        input.display()
    );
    native.optimize(input, use_gpu, output)?;

    if !output.is_file() {
        return Err(FusionError::NativeOptimizer(format!(
            "no output written to '{}'",
            output.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use crate::op::OpType;
    use crate::pipeline::{FusionOptions, FusionPipeline, ModelType};
    use crate::testing::{bert_model, BERT_HIDDEN, HEADS};

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("transformer_optimizer_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    /// Stand-in for the framework optimizer: runs our own pipeline on
    /// the reference encoder and records the resulting fused counts.
    struct PipelineBackedOptimizer;

    impl NativeOptimizer for PipelineBackedOptimizer {
        fn optimize(&self, _input: &Path, use_gpu: bool, output: &Path) -> FusionResult<()> {
            let mut model = bert_model();
            let opts = FusionOptions::new(HEADS, BERT_HIDDEN).with_gpu(use_gpu);
            let report = FusionPipeline::run(ModelType::Bert, &mut model, &opts)?;

            let mut lines = String::new();
            for (op, count) in report.fused_counts() {
                lines.push_str(&format!("{op}={count}\n"));
            }
            fs::write(output, lines)?;
            Ok(())
        }
    }

    struct SilentlyFailingOptimizer;

    impl NativeOptimizer for SilentlyFailingOptimizer {
        fn optimize(&self, _input: &Path, _use_gpu: bool, _output: &Path) -> FusionResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_missing_input_is_an_io_error() {
        let input = scratch("does_not_exist.onnx");
        let output = scratch("out_missing_input.onnx");
        let err =
            optimize_by_native(&PipelineBackedOptimizer, &input, false, &output).unwrap_err();
        assert!(matches!(err, FusionError::Io(_)));
    }

    #[test]
    fn test_unwritten_output_is_reported() {
        let input = scratch("in_unwritten.onnx");
        fs::write(&input, b"model bytes").unwrap();
        let output = scratch("out_unwritten.onnx");

        let err =
            optimize_by_native(&SilentlyFailingOptimizer, &input, false, &output).unwrap_err();
        assert!(matches!(err, FusionError::NativeOptimizer(_)));
    }

    #[test]
    fn test_native_run_matches_reference_table() {
        let input = scratch("in_reference.onnx");
        fs::write(&input, b"model bytes").unwrap();
        let output = scratch("out_reference.txt");

        optimize_by_native(&PipelineBackedOptimizer, &input, false, &output).unwrap();

        let written = fs::read_to_string(&output).unwrap();
        for expected in [
            format!("{}=1", OpType::EmbedLayerNormalization),
            format!("{}=12", OpType::Attention),
            format!("{}=24", OpType::SkipLayerNormalization),
            format!("{}=12", OpType::BiasGelu),
            format!("{}=0", OpType::FastGelu),
        ] {
            assert!(written.contains(&expected), "missing line: {expected}");
        }
    }

    #[test]
    fn test_native_gpu_run_prefers_fast_gelu() {
        let input = scratch("in_gpu.onnx");
        fs::write(&input, b"model bytes").unwrap();
        let output = scratch("out_gpu.txt");

        optimize_by_native(&PipelineBackedOptimizer, &input, true, &output).unwrap();

        let written = fs::read_to_string(&output).unwrap();
        assert!(written.contains(&format!("{}=12", OpType::FastGelu)));
        assert!(written.contains(&format!("{}=0", OpType::BiasGelu)));
    }
}
