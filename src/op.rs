//! Operator-type vocabulary
//!
//! Fusion passes dispatch on a closed enumeration of operator types
//! rather than comparing strings. Operators outside the vocabulary are
//! carried through untouched as [`OpType::Unknown`].

use std::fmt;
use std::str::FromStr;

/// Closed operator-type tag
///
/// Covers every operator the fusion passes read (raw constituent ops)
/// or emit (fused ops). Anything else round-trips through
/// [`OpType::Unknown`] and is never matched or rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpType {
    // Element-wise and linear-algebra primitives
    /// Element-wise addition
    Add,
    /// Element-wise subtraction
    Sub,
    /// Element-wise multiplication
    Mul,
    /// Element-wise division
    Div,
    /// Element-wise power
    Pow,
    /// Element-wise square root
    Sqrt,
    /// Error function
    Erf,
    /// Hyperbolic tangent
    Tanh,
    /// Matrix product
    MatMul,
    /// Embedding-table lookup
    Gather,
    /// Mean reduction
    ReduceMean,
    /// Softmax over the last axis
    Softmax,
    /// Shape change
    Reshape,
    /// Axis permutation
    Transpose,
    /// Concatenation along an axis
    Concat,
    /// Split along an axis
    Split,
    /// Element-type conversion
    Cast,
    /// Identity passthrough
    Identity,
    /// Layer normalization
    LayerNormalization,

    // Fused operators emitted by the passes
    /// Fused embedding lookups + layer normalization
    EmbedLayerNormalization,
    /// Fused multi-head self-attention block
    Attention,
    /// Fused residual addition + layer normalization
    SkipLayerNormalization,
    /// Exact (erf-based) gelu
    Gelu,
    /// Tanh-approximated gelu, optionally with bias
    FastGelu,
    /// Bias addition fused with exact gelu
    BiasGelu,

    /// Operator outside the fusion vocabulary, carried through as-is
    Unknown(String),
}

impl OpType {
    /// Canonical operator name
    pub fn as_str(&self) -> &str {
        match self {
            OpType::Add => "Add",
            OpType::Sub => "Sub",
            OpType::Mul => "Mul",
            OpType::Div => "Div",
            OpType::Pow => "Pow",
            OpType::Sqrt => "Sqrt",
            OpType::Erf => "Erf",
            OpType::Tanh => "Tanh",
            OpType::MatMul => "MatMul",
            OpType::Gather => "Gather",
            OpType::ReduceMean => "ReduceMean",
            OpType::Softmax => "Softmax",
            OpType::Reshape => "Reshape",
            OpType::Transpose => "Transpose",
            OpType::Concat => "Concat",
            OpType::Split => "Split",
            OpType::Cast => "Cast",
            OpType::Identity => "Identity",
            OpType::LayerNormalization => "LayerNormalization",
            OpType::EmbedLayerNormalization => "EmbedLayerNormalization",
            OpType::Attention => "Attention",
            OpType::SkipLayerNormalization => "SkipLayerNormalization",
            OpType::Gelu => "Gelu",
            OpType::FastGelu => "FastGelu",
            OpType::BiasGelu => "BiasGelu",
            OpType::Unknown(s) => s.as_str(),
        }
    }

    /// Whether this operator is one the fusion passes emit
    pub fn is_fused(&self) -> bool {
        matches!(
            self,
            OpType::EmbedLayerNormalization
                | OpType::Attention
                | OpType::SkipLayerNormalization
                | OpType::Gelu
                | OpType::FastGelu
                | OpType::BiasGelu
        )
    }
}

/// Operator types reported by [`crate::report::OptimizationReport`]
pub const REPORTED_OPS: &[OpType] = &[
    OpType::EmbedLayerNormalization,
    OpType::Attention,
    OpType::SkipLayerNormalization,
    OpType::Gelu,
    OpType::FastGelu,
    OpType::BiasGelu,
    OpType::LayerNormalization,
];

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Add" => OpType::Add,
            "Sub" => OpType::Sub,
            "Mul" => OpType::Mul,
            "Div" => OpType::Div,
            "Pow" => OpType::Pow,
            "Sqrt" => OpType::Sqrt,
            "Erf" => OpType::Erf,
            "Tanh" => OpType::Tanh,
            "MatMul" => OpType::MatMul,
            "Gather" => OpType::Gather,
            "ReduceMean" => OpType::ReduceMean,
            "Softmax" => OpType::Softmax,
            "Reshape" => OpType::Reshape,
            "Transpose" => OpType::Transpose,
            "Concat" => OpType::Concat,
            "Split" => OpType::Split,
            "Cast" => OpType::Cast,
            "Identity" => OpType::Identity,
            "LayerNormalization" => OpType::LayerNormalization,
            "EmbedLayerNormalization" => OpType::EmbedLayerNormalization,
            "Attention" => OpType::Attention,
            "SkipLayerNormalization" => OpType::SkipLayerNormalization,
            "Gelu" => OpType::Gelu,
            "FastGelu" => OpType::FastGelu,
            "BiasGelu" => OpType::BiasGelu,
            other => OpType::Unknown(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_round_trip() {
        for op in [
            OpType::Add,
            OpType::MatMul,
            OpType::LayerNormalization,
            OpType::Attention,
            OpType::BiasGelu,
        ] {
            let parsed: OpType = op.as_str().parse().unwrap();
            assert_eq!(parsed, op);
        }
    }

    #[test]
    fn test_unknown_passthrough() {
        let op: OpType = "SomeVendorOp".parse().unwrap();
        assert_eq!(op, OpType::Unknown("SomeVendorOp".to_string()));
        assert_eq!(op.as_str(), "SomeVendorOp");
        assert!(!op.is_fused());
    }

    #[test]
    fn test_is_fused() {
        assert!(OpType::Attention.is_fused());
        assert!(OpType::FastGelu.is_fused());
        assert!(!OpType::Softmax.is_fused());
        assert!(!OpType::LayerNormalization.is_fused());
    }
}
