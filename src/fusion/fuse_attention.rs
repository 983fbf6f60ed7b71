//! Multi-head attention fusion
//!
//! Matches the canonical scaled-dot-product block: three projection
//! branches (`MatMul -> Add -> Reshape -> Transpose`) off one root
//! tensor, a scaled score product with optional mask addition, softmax
//! over the last axis, the context product with the value branch, and
//! the head-merge transpose/reshape. Decoder exports may splice cached
//! past state into the key and value paths through a `Concat`; the
//! concat outputs become the fused node's `present` outputs.
//!
//! The replacement packs the three projection weights and biases into
//! single `qkv` initializers, which the original graph does not carry.
//! The output projection that follows the block stays raw.

use log::debug;
use rustc_hash::FxHashSet;

use crate::error::{FusionError, FusionResult};
use crate::graph::{GraphModel, Initializer, Node, NodeId, TensorId};
use crate::op::OpType;
use crate::pipeline::FusionOptions;

use super::common::{outputs_contained, sole_consumer_of_type, FusionPass, FusionStats};

/// One traced projection branch
struct Projection {
    weight: TensorId,
    bias: TensorId,
    /// Transpose output carrying the per-head layout
    head: TensorId,
    nodes: [NodeId; 4],
}

/// Cached past state spliced into a key or value path
struct PastSplice {
    past: TensorId,
    present: TensorId,
    concat: NodeId,
}

struct AttentionMatch {
    root: TensorId,
    q: Projection,
    k: Projection,
    v: Projection,
    mask: Option<TensorId>,
    past_k: Option<PastSplice>,
    past_v: Option<PastSplice>,
    out: TensorId,
    nodes: Vec<NodeId>,
}

/// Fuses the scaled-dot-product attention block
#[derive(Debug, Default)]
pub struct FuseAttention {
    unidirectional: bool,
}

impl FuseAttention {
    /// Create the pass for encoder exports
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pass for decoder-only exports
    ///
    /// The fused node carries `unidirectional = 1` so the kernel applies
    /// the causal mask itself.
    pub fn unidirectional() -> Self {
        Self { unidirectional: true }
    }

    /// Trace `root -> MatMul -> Add(bias) -> Reshape -> Transpose`
    fn trace_projection(
        &self,
        model: &GraphModel,
        root: TensorId,
        mm_id: NodeId,
    ) -> Option<Projection> {
        let mm = model.node(mm_id);
        if mm.inputs.len() != 2 || mm.inputs[0] != root {
            return None;
        }
        let weight = mm.inputs[1];
        model
            .initializer(weight)
            .filter(|init| init.dims.len() == 2 && init.f32_data().is_some())?;

        let add_id = sole_consumer_of_type(model, mm.outputs[0], &OpType::Add)?;
        let add = model.node(add_id);
        let bias = add.other_input(mm.outputs[0])?;
        model
            .initializer(bias)
            .filter(|init| init.dims.len() == 1 && init.f32_data().is_some())?;

        let reshape_id = sole_consumer_of_type(model, add.outputs[0], &OpType::Reshape)?;
        let reshape = model.node(reshape_id);
        let transpose_id = sole_consumer_of_type(model, reshape.outputs[0], &OpType::Transpose)?;

        Some(Projection {
            weight,
            bias,
            head: model.node(transpose_id).outputs[0],
            nodes: [mm_id, add_id, reshape_id, transpose_id],
        })
    }

    /// Absorb a `Concat(past, head)` splice, if present
    ///
    /// Returns the tensor the downstream matrix product actually reads,
    /// together with the splice description.
    fn trace_splice(
        &self,
        model: &GraphModel,
        head: TensorId,
    ) -> Option<(TensorId, Option<PastSplice>)> {
        let consumer = model.single_consumer(head)?;
        let node = model.node(consumer);
        if node.op != OpType::Concat {
            return Some((head, None));
        }
        if node.inputs.len() != 2 || node.inputs[1] != head {
            return None;
        }
        let past = node.inputs[0];
        if !model.is_graph_input(past) {
            return None;
        }
        let present = node.outputs[0];
        Some((present, Some(PastSplice { past, present, concat: consumer })))
    }

    /// Structural match around one root tensor
    fn trace(&self, model: &GraphModel, root: TensorId) -> Option<AttentionMatch> {
        // Exactly three projections read the root.
        let mut proj_ids: Vec<NodeId> = Vec::new();
        for &c in model.consumers_of(root) {
            if model.node(c).op == OpType::MatMul && !proj_ids.contains(&c) {
                proj_ids.push(c);
            }
        }
        if proj_ids.len() != 3 {
            return None;
        }
        let mut projs: Vec<Projection> = Vec::with_capacity(3);
        for &id in &proj_ids {
            projs.push(self.trace_projection(model, root, id)?);
        }

        let mut keys: Vec<TensorId> = Vec::with_capacity(3);
        let mut splices: Vec<Option<PastSplice>> = Vec::with_capacity(3);
        for proj in &projs {
            let (key, splice) = self.trace_splice(model, proj.head)?;
            keys.push(key);
            splices.push(splice);
        }

        // The score product joins the query branch (position 0) with the
        // key branch (position 1); the value branch is what remains.
        let mut roles = None;
        for q in 0..3 {
            let Some(m) = model.single_consumer(keys[q]) else {
                continue;
            };
            let node = model.node(m);
            if node.op != OpType::MatMul || node.inputs.len() != 2 || node.inputs[0] != keys[q] {
                continue;
            }
            if let Some(k) = (0..3).find(|&k| k != q && keys[k] == node.inputs[1]) {
                roles = Some((q, k, m));
                break;
            }
        }
        let (q_idx, k_idx, score_id) = roles?;
        let v_idx = 3 - q_idx - k_idx;
        // The query path never carries cached state.
        if splices[q_idx].is_some() {
            return None;
        }

        // Score scaling, optional mask addition, softmax.
        let score_out = model.node(score_id).outputs[0];
        let div_id = sole_consumer_of_type(model, score_out, &OpType::Div)?;
        let div = model.node(div_id);
        if div.inputs.len() != 2 || div.inputs[0] != score_out {
            return None;
        }
        model.initializer(div.inputs[1]).and_then(Initializer::scalar_f32)?;

        let after_id = model.single_consumer(div.outputs[0])?;
        let (mask, mask_add, softmax_id) = match model.node(after_id).op {
            OpType::Add => {
                let mask = model.node(after_id).other_input(div.outputs[0])?;
                let softmax = sole_consumer_of_type(
                    model,
                    model.node(after_id).outputs[0],
                    &OpType::Softmax,
                )?;
                (Some(mask), Some(after_id), softmax)
            }
            OpType::Softmax => (None, None, after_id),
            _ => return None,
        };

        // Context product with the value branch, then the head merge.
        let softmax_out = model.node(softmax_id).outputs[0];
        let ctx_id = sole_consumer_of_type(model, softmax_out, &OpType::MatMul)?;
        let ctx = model.node(ctx_id);
        if ctx.inputs.len() != 2 || ctx.inputs[0] != softmax_out || ctx.inputs[1] != keys[v_idx] {
            return None;
        }
        let merge_t_id = sole_consumer_of_type(model, ctx.outputs[0], &OpType::Transpose)?;
        let merge_r_id =
            sole_consumer_of_type(model, model.node(merge_t_id).outputs[0], &OpType::Reshape)?;
        let out = model.node(merge_r_id).outputs[0];

        let mut slots: Vec<Option<Projection>> = projs.into_iter().map(Some).collect();
        let q = slots[q_idx].take()?;
        let k = slots[k_idx].take()?;
        let v = slots[v_idx].take()?;
        let past_k = splices[k_idx].take();
        let past_v = splices[v_idx].take();

        let mut nodes = Vec::with_capacity(22);
        for proj in [&q, &k, &v] {
            nodes.extend_from_slice(&proj.nodes);
        }
        nodes.extend([score_id, div_id]);
        if let Some(add) = mask_add {
            nodes.push(add);
        }
        nodes.extend([softmax_id, ctx_id, merge_t_id, merge_r_id]);
        for splice in [&past_k, &past_v].into_iter().flatten() {
            nodes.push(splice.concat);
        }

        // The mask comes from outside the block.
        if let Some(mask) = mask {
            if mask == root || model.producer_of(mask).is_some_and(|p| nodes.contains(&p)) {
                return None;
            }
        }

        let mut reproduced = vec![out];
        reproduced.extend([&past_k, &past_v].into_iter().flatten().map(|s| s.present));
        if !outputs_contained(model, &nodes, &reproduced) {
            return None;
        }

        Some(AttentionMatch {
            root,
            q,
            k,
            v,
            mask,
            past_k,
            past_v,
            out,
            nodes,
        })
    }

    /// Validate caller-supplied geometry and pack the `qkv` initializers
    fn pack(
        &self,
        model: &GraphModel,
        m: &AttentionMatch,
        opts: &FusionOptions,
    ) -> FusionResult<(Initializer, Initializer)> {
        let hidden = opts.hidden_size as i64;
        let context = |what: &str| format!("{} of '{}'", what, model.tensor_name(m.out));

        if opts.num_heads == 0 || opts.hidden_size % opts.num_heads != 0 {
            return Err(FusionError::ShapeInconsistency {
                expected: (opts.hidden_size / opts.num_heads.max(1) * opts.num_heads) as i64,
                actual: hidden,
                context: context("head split"),
            });
        }
        for proj in [&m.q, &m.k, &m.v] {
            let dims = model
                .initializer(proj.weight)
                .map(|init| init.dims.clone())
                .unwrap_or_default();
            if dims != [hidden, hidden] {
                return Err(FusionError::ShapeInconsistency {
                    expected: hidden,
                    actual: dims.last().copied().unwrap_or(0),
                    context: context("projection weight"),
                });
            }
            let bias_len = model
                .initializer(proj.bias)
                .map(|init| init.num_elements() as i64)
                .unwrap_or(0);
            if bias_len != hidden {
                return Err(FusionError::ShapeInconsistency {
                    expected: hidden,
                    actual: bias_len,
                    context: context("projection bias"),
                });
            }
        }

        let data_of = |t: TensorId| {
            model
                .initializer(t)
                .and_then(Initializer::f32_data)
                .ok_or_else(|| {
                    FusionError::InvalidModel(format!(
                        "attention projection tensor '{}' is not a float initializer",
                        model.tensor_name(t)
                    ))
                })
        };
        let h = opts.hidden_size;
        let (wq, wk, wv) = (data_of(m.q.weight)?, data_of(m.k.weight)?, data_of(m.v.weight)?);

        // Row-interleave the three [h, h] weights into [h, 3h].
        let mut weight = Vec::with_capacity(h * 3 * h);
        for r in 0..h {
            for w in [wq, wk, wv] {
                weight.extend_from_slice(&w[r * h..(r + 1) * h]);
            }
        }
        let mut bias = Vec::with_capacity(3 * h);
        for b in [m.q.bias, m.k.bias, m.v.bias] {
            bias.extend_from_slice(data_of(b)?);
        }

        let base = model.tensor_name(m.out).to_string();
        Ok((
            Initializer::f32(
                format!("{base}_qkv_weight"),
                vec![hidden, 3 * hidden],
                weight,
            ),
            Initializer::f32(format!("{base}_qkv_bias"), vec![3 * hidden], bias),
        ))
    }
}

impl FusionPass for FuseAttention {
    fn name(&self) -> &'static str {
        "attention"
    }

    fn raw_ops(&self) -> &'static [OpType] {
        &[OpType::Softmax]
    }

    fn run(&self, model: &mut GraphModel, opts: &FusionOptions) -> FusionResult<FusionStats> {
        let mut stats = FusionStats::new();
        let mut seen_roots: FxHashSet<TensorId> = FxHashSet::default();

        for mm_id in model.nodes_of_type(&OpType::MatMul) {
            if model.node(mm_id).is_deleted() {
                continue;
            }
            let Some(&root) = model.node(mm_id).inputs.first() else {
                continue;
            };
            if model.is_initializer(root) || !seen_roots.insert(root) {
                continue;
            }
            let Some(m) = self.trace(model, root) else {
                continue;
            };

            let (w_init, b_init) = match self.pack(model, &m, opts) {
                Ok(packed) => packed,
                Err(err @ FusionError::ShapeInconsistency { .. }) => {
                    debug!("attention: skipping anchor: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let w_id = model.intern(&w_init.name);
            let b_id = model.intern(&b_init.name);

            let mut fused = Node::new(OpType::Attention)
                .with_name(format!("attention_{}", stats.fused))
                .with_inputs(vec![m.root, w_id, b_id])
                .with_attr_i("num_heads", opts.num_heads as i64);
            if let Some(mask) = m.mask {
                fused = fused.with_input(mask);
            }
            for splice in [&m.past_k, &m.past_v].into_iter().flatten() {
                fused = fused.with_input(splice.past);
            }
            fused = fused.with_output(m.out);
            for splice in [&m.past_k, &m.past_v].into_iter().flatten() {
                fused = fused.with_output(splice.present);
            }
            if self.unidirectional {
                fused = fused.with_attr_i("unidirectional", 1);
            }

            model.replace_subgraph(&m.nodes, fused, vec![w_init, b_init])?;
            debug!(
                "attention: fused block into '{}'",
                model.tensor_name(m.out)
            );
            stats.record(m.nodes.len());
        }
        Ok(stats)
    }
}
