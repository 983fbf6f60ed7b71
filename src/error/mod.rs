//! Error types for the fusion engine
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Main error type for graph fusion operations
///
/// Only [`FusionError::InvalidModel`] aborts a pipeline run. Pattern and
/// shape failures are local to a single anchor: the owning pass logs
/// them and moves on to the next candidate.
#[derive(Error, Debug)]
pub enum FusionError {
    /// A candidate subgraph did not match the expected shape
    ///
    /// Non-fatal. Mismatches are expected during scanning and never
    /// escape the pass that produced them.
    #[error("pattern mismatch: {0}")]
    PatternMismatch(String),

    /// Caller-supplied geometry disagrees with the graph
    ///
    /// Fatal to a single fusion attempt; the anchor is left unfused and
    /// the pipeline continues.
    #[error("shape inconsistency in {context}: expected {expected}, got {actual}")]
    ShapeInconsistency {
        /// Expected dimension or divisor
        expected: i64,
        /// Dimension actually found in the graph
        actual: i64,
        /// Which check failed
        context: String,
    },

    /// The graph violates its structural contract
    ///
    /// Cycles, duplicate tensor producers, dangling references, or a
    /// replacement that would orphan an externally consumed tensor.
    /// Aborts the whole optimization run.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The native optimizer reported failure or produced no output
    #[error("native optimizer failed: {0}")]
    NativeOptimizer(String),

    /// IO error while delegating to the native optimizer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;
