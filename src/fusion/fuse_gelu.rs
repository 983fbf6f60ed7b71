//! Activation-family fusion
//!
//! Recognizes the two gelu approximation idioms exporters emit:
//!
//! - exact, error-function based:
//!   `Div(x, √2) -> Erf -> Add(+1) -> Mul(×0.5) -> Mul(×x)`
//! - tanh polynomial:
//!   `Pow(x, 3) -> Mul(×0.044715) -> Add(+x) -> Mul(×√(2/π)) -> Tanh ->
//!   Add(+1) -> Mul(×x) -> Mul(×0.5)`
//!
//! with the trailing multiplications accepted in either order. A bias
//! addition feeding the idiom's root is folded into the fused node when
//! nothing else reads the biased tensor.
//!
//! The emitted op type depends on shape, bias, and the caller's
//! execution target: the GPU path has no `BiasGelu` kernel, so biased
//! erf matches emit `FastGelu` there instead.

use log::debug;

use crate::error::FusionResult;
use crate::graph::{GraphModel, Node, NodeId, TensorId};
use crate::op::OpType;
use crate::pipeline::FusionOptions;

use super::common::{outputs_contained, scalar_init_is, sole_consumer_of_type, FusionPass, FusionStats};

/// The Erf operator only exists from this operator-set version on.
const ERF_MIN_OPSET: i64 = 9;

const GELU_CUBIC_COEFF: f32 = 0.044715;

struct GeluMatch {
    root: TensorId,
    bias: Option<TensorId>,
    out: TensorId,
    tanh: bool,
    nodes: Vec<NodeId>,
}

/// Fuses gelu approximation idioms into `Gelu` / `FastGelu` / `BiasGelu`
#[derive(Debug, Default)]
pub struct FuseGeluFamily;

impl FuseGeluFamily {
    /// Create the pass
    pub fn new() -> Self {
        Self
    }

    /// Match the error-function idiom rooted at a `Div` anchor
    fn match_erf(&self, model: &GraphModel, div_id: NodeId) -> Option<GeluMatch> {
        let div = model.node(div_id);
        if div.inputs.len() != 2 {
            return None;
        }
        let x = div.inputs[0];
        if !scalar_init_is(model, div.inputs[1], std::f32::consts::SQRT_2) {
            return None;
        }

        let erf_id = sole_consumer_of_type(model, div.outputs[0], &OpType::Erf)?;
        let erf_out = model.node(erf_id).outputs[0];

        let add_id = sole_consumer_of_type(model, erf_out, &OpType::Add)?;
        let add = model.node(add_id);
        let one = add.other_input(erf_out)?;
        if !scalar_init_is(model, one, 1.0) {
            return None;
        }

        let mul1_id = sole_consumer_of_type(model, add.outputs[0], &OpType::Mul)?;
        let mul1 = model.node(mul1_id);
        let other1 = mul1.other_input(add.outputs[0])?;

        let mul2_id = sole_consumer_of_type(model, mul1.outputs[0], &OpType::Mul)?;
        let mul2 = model.node(mul2_id);
        let other2 = mul2.other_input(mul1.outputs[0])?;

        // Exporters order the final multiplications both ways.
        let ordered = (scalar_init_is(model, other1, 0.5) && other2 == x)
            || (other1 == x && scalar_init_is(model, other2, 0.5));
        if !ordered {
            return None;
        }

        let out = mul2.outputs[0];
        let mut nodes = vec![div_id, erf_id, add_id, mul1_id, mul2_id];
        let (root, bias) = self.fold_bias(model, x, &mut nodes);
        if !outputs_contained(model, &nodes, &[out]) {
            return None;
        }
        Some(GeluMatch { root, bias, out, tanh: false, nodes })
    }

    /// Match the tanh polynomial idiom rooted at a `Pow` anchor
    fn match_tanh(&self, model: &GraphModel, pow_id: NodeId) -> Option<GeluMatch> {
        let pow = model.node(pow_id);
        if pow.inputs.len() != 2 {
            return None;
        }
        let x = pow.inputs[0];
        if !scalar_init_is(model, pow.inputs[1], 3.0) {
            return None;
        }

        let mul1_id = sole_consumer_of_type(model, pow.outputs[0], &OpType::Mul)?;
        let mul1 = model.node(mul1_id);
        let coeff = mul1.other_input(pow.outputs[0])?;
        if !scalar_init_is(model, coeff, GELU_CUBIC_COEFF) {
            return None;
        }

        let add1_id = sole_consumer_of_type(model, mul1.outputs[0], &OpType::Add)?;
        let add1 = model.node(add1_id);
        if add1.other_input(mul1.outputs[0])? != x {
            return None;
        }

        let mul2_id = sole_consumer_of_type(model, add1.outputs[0], &OpType::Mul)?;
        let mul2 = model.node(mul2_id);
        let scale = mul2.other_input(add1.outputs[0])?;
        if !scalar_init_is(model, scale, (2.0 / std::f32::consts::PI).sqrt()) {
            return None;
        }

        let tanh_id = sole_consumer_of_type(model, mul2.outputs[0], &OpType::Tanh)?;
        let tanh_out = model.node(tanh_id).outputs[0];

        let add2_id = sole_consumer_of_type(model, tanh_out, &OpType::Add)?;
        let add2 = model.node(add2_id);
        let one = add2.other_input(tanh_out)?;
        if !scalar_init_is(model, one, 1.0) {
            return None;
        }

        let mul3_id = sole_consumer_of_type(model, add2.outputs[0], &OpType::Mul)?;
        let mul3 = model.node(mul3_id);
        let other3 = mul3.other_input(add2.outputs[0])?;

        let mul4_id = sole_consumer_of_type(model, mul3.outputs[0], &OpType::Mul)?;
        let mul4 = model.node(mul4_id);
        let other4 = mul4.other_input(mul3.outputs[0])?;

        let ordered = (other3 == x && scalar_init_is(model, other4, 0.5))
            || (scalar_init_is(model, other3, 0.5) && other4 == x);
        if !ordered {
            return None;
        }

        let out = mul4.outputs[0];
        let mut nodes = vec![
            pow_id, mul1_id, add1_id, mul2_id, tanh_id, add2_id, mul3_id, mul4_id,
        ];
        let (root, bias) = self.fold_bias(model, x, &mut nodes);
        if !outputs_contained(model, &nodes, &[out]) {
            return None;
        }
        Some(GeluMatch { root, bias, out, tanh: true, nodes })
    }

    /// Fold a bias addition feeding the idiom's root, if it is exclusive
    ///
    /// The biased tensor must be read only by the matched idiom; a bias
    /// shared with another consumer stays where it is.
    fn fold_bias(
        &self,
        model: &GraphModel,
        x: TensorId,
        nodes: &mut Vec<NodeId>,
    ) -> (TensorId, Option<TensorId>) {
        let Some(add_id) = model.producer_of(x) else {
            return (x, None);
        };
        let add = model.node(add_id);
        if add.op != OpType::Add || add.inputs.len() != 2 {
            return (x, None);
        }
        let is_bias = |t: TensorId| {
            model
                .initializer(t)
                .is_some_and(|init| init.dims.len() == 1)
        };
        let (bias, input) = if is_bias(add.inputs[1]) {
            (add.inputs[1], add.inputs[0])
        } else if is_bias(add.inputs[0]) {
            (add.inputs[0], add.inputs[1])
        } else {
            return (x, None);
        };
        if model.is_graph_output(x)
            || model.consumers_of(x).iter().any(|c| !nodes.contains(c))
        {
            return (x, None);
        }
        nodes.push(add_id);
        (input, Some(bias))
    }

    fn emit(
        &self,
        model: &mut GraphModel,
        m: GeluMatch,
        opts: &FusionOptions,
        stats: &mut FusionStats,
    ) -> FusionResult<()> {
        let op = match (&m.bias, m.tanh, opts.use_gpu) {
            (_, true, _) => OpType::FastGelu,
            (None, false, _) => OpType::Gelu,
            (Some(_), false, false) => OpType::BiasGelu,
            (Some(_), false, true) => OpType::FastGelu,
        };
        let tag = match op {
            OpType::Gelu => "gelu",
            OpType::BiasGelu => "bias_gelu",
            _ => "fast_gelu",
        };

        let mut fused = Node::new(op)
            .with_name(format!("{}_{}", tag, stats.fused))
            .with_input(m.root);
        if let Some(bias) = m.bias {
            fused = fused.with_input(bias);
        }
        let fused = fused.with_output(m.out);

        model.replace_subgraph(&m.nodes, fused, vec![])?;
        debug!("gelu_family: fused {} into '{}'", tag, model.tensor_name(m.out));
        stats.record(m.nodes.len());
        Ok(())
    }
}

impl FusionPass for FuseGeluFamily {
    fn name(&self) -> &'static str {
        "gelu_family"
    }

    fn raw_ops(&self) -> &'static [OpType] {
        &[OpType::Erf, OpType::Tanh]
    }

    fn run(&self, model: &mut GraphModel, opts: &FusionOptions) -> FusionResult<FusionStats> {
        let mut stats = FusionStats::new();

        if model.opset_version() >= ERF_MIN_OPSET {
            for div_id in model.nodes_of_type(&OpType::Div) {
                if model.node(div_id).is_deleted() {
                    continue;
                }
                if let Some(m) = self.match_erf(model, div_id) {
                    self.emit(model, m, opts, &mut stats)?;
                }
            }
        } else {
            debug!(
                "gelu_family: opset {} predates Erf, skipping erf idiom",
                model.opset_version()
            );
        }

        for pow_id in model.nodes_of_type(&OpType::Pow) {
            if model.node(pow_id).is_deleted() {
                continue;
            }
            if let Some(m) = self.match_tanh(model, pow_id) {
                self.emit(model, m, opts, &mut stats)?;
            }
        }

        Ok(stats)
    }
}
