//! Synthetic reference models shared by the test suites
//!
//! Hand-built graphs mirroring what the exporters actually emit: a
//! 12-layer post-norm encoder, a pre-norm variant whose residual sums
//! fan out downstream, and a decoder-only stack with optional cached
//! past state. Geometry is kept small (hidden 8, heads 2; hidden 4 for
//! the decoder) so packed initializers stay readable in failures.

use crate::graph::{GraphModel, Initializer, Node, TensorId};
use crate::op::OpType;

/// Transformer layers in every reference model
pub const LAYERS: usize = 12;
/// Attention heads
pub const HEADS: usize = 2;
/// Encoder hidden dimension
pub const BERT_HIDDEN: usize = 8;
/// Decoder hidden dimension
pub const GPT2_HIDDEN: usize = 4;

/// Constant-filled float initializer
fn weight(m: &mut GraphModel, name: impl Into<String>, dims: Vec<i64>, value: f32) -> TensorId {
    let len = dims.iter().product::<i64>() as usize;
    m.add_initializer(Initializer::f32(name, dims, vec![value; len]))
        .unwrap()
}

/// Scalar float initializer
fn scalar(m: &mut GraphModel, name: impl Into<String>, value: f32) -> TensorId {
    m.add_initializer(Initializer::scalar(name, value)).unwrap()
}

/// `op(x) -> out`
fn unary(m: &mut GraphModel, op: OpType, x: TensorId, out: impl AsRef<str>) -> TensorId {
    let out = m.intern(out);
    m.add_node(Node::new(op).with_input(x).with_output(out)).unwrap();
    out
}

/// `op(a, b) -> out`
fn binary(
    m: &mut GraphModel,
    op: OpType,
    a: TensorId,
    b: TensorId,
    out: impl AsRef<str>,
) -> TensorId {
    let out = m.intern(out);
    m.add_node(Node::new(op).with_input(a).with_input(b).with_output(out))
        .unwrap();
    out
}

/// `MatMul(input, weight) -> Add(bias)`
fn linear(m: &mut GraphModel, prefix: &str, input: TensorId, rows: usize, cols: usize) -> TensorId {
    let w = weight(m, format!("{prefix}_weight"), vec![rows as i64, cols as i64], 0.02);
    let b = weight(m, format!("{prefix}_bias"), vec![cols as i64], 0.0);
    let mm = binary(m, OpType::MatMul, input, w, format!("{prefix}_mm_out"));
    binary(m, OpType::Add, mm, b, format!("{prefix}_out"))
}

/// Standalone `LayerNormalization` with fresh scale and bias
fn layer_norm(m: &mut GraphModel, prefix: &str, input: TensorId, hidden: usize) -> TensorId {
    let gamma = weight(m, format!("{prefix}_gamma"), vec![hidden as i64], 1.0);
    let beta = weight(m, format!("{prefix}_beta"), vec![hidden as i64], 0.0);
    let out = m.intern(format!("{prefix}_norm_out"));
    m.add_node(
        Node::new(OpType::LayerNormalization)
            .with_input(input)
            .with_input(gamma)
            .with_input(beta)
            .with_output(out)
            .with_attr_f("epsilon", 1e-12),
    )
    .unwrap();
    out
}

/// `Add(branch, residual) -> LayerNormalization`, post-norm style
fn residual_norm(
    m: &mut GraphModel,
    prefix: &str,
    branch: TensorId,
    residual: TensorId,
    hidden: usize,
) -> TensorId {
    let sum = binary(m, OpType::Add, branch, residual, format!("{prefix}_sum"));
    layer_norm(m, prefix, sum, hidden)
}

/// Word/position/segment lookup chain feeding the encoder's first
/// normalization
///
/// Declares `input_ids` and `segment_ids` as graph inputs; the position
/// lookup reads a constant id sequence the way the exporters bake it in.
pub fn bert_embedding(m: &mut GraphModel) -> TensorId {
    let h = BERT_HIDDEN as i64;
    let input_ids = m.add_input("input_ids");
    let segment_ids = m.add_input("segment_ids");

    let word_table = weight(m, "word_table", vec![30, h], 0.01);
    let position_table = weight(m, "position_table", vec![16, h], 0.01);
    let segment_table = weight(m, "segment_table", vec![2, h], 0.01);
    let position_ids = m
        .add_initializer(Initializer::i64("position_ids", vec![16], (0..16).collect()))
        .unwrap();

    let word = binary(m, OpType::Gather, word_table, input_ids, "word_embed");
    let position = binary(m, OpType::Gather, position_table, position_ids, "position_embed");
    let inner = binary(m, OpType::Add, word, position, "embed_sum_wp");
    let segment = binary(m, OpType::Gather, segment_table, segment_ids, "segment_embed");
    let sum = binary(m, OpType::Add, inner, segment, "embed_sum");
    layer_norm(m, "embed", sum, BERT_HIDDEN)
}

/// Canonical scaled-dot-product block hanging off `root`
///
/// Projection weights are seeded 0.1/0.2/0.3 for q/k/v so the packed
/// `qkv` layout is observable after fusion. With `past`, cached key and
/// value state enters through per-layer graph inputs, is spliced in via
/// `Concat`, and the concat outputs are declared graph outputs.
pub fn attention_block(
    m: &mut GraphModel,
    prefix: &str,
    root: TensorId,
    hidden: usize,
    mask: Option<TensorId>,
    past: bool,
) -> TensorId {
    let h = hidden as i64;
    let head_dim = (hidden / HEADS) as i64;
    let head_shape = m
        .add_initializer(Initializer::i64(
            format!("{prefix}_head_shape"),
            vec![4],
            vec![0, 0, HEADS as i64, head_dim],
        ))
        .unwrap();
    let merge_shape = m
        .add_initializer(Initializer::i64(
            format!("{prefix}_merge_shape"),
            vec![3],
            vec![0, 0, h],
        ))
        .unwrap();

    // The key branch transposes straight to [batch, heads, dim, seq] so
    // the score product reads it without a separate transpose.
    let mut heads = Vec::with_capacity(3);
    for (branch, seed, perm) in [
        ("q", 0.1, vec![0, 2, 1, 3]),
        ("k", 0.2, vec![0, 2, 3, 1]),
        ("v", 0.3, vec![0, 2, 1, 3]),
    ] {
        let w = weight(m, format!("{prefix}_{branch}_weight"), vec![h, h], seed);
        let b = weight(m, format!("{prefix}_{branch}_bias"), vec![h], 0.0);
        let mm = binary(m, OpType::MatMul, root, w, format!("{prefix}_{branch}_mm_out"));
        let biased = binary(m, OpType::Add, mm, b, format!("{prefix}_{branch}_add_out"));
        let split = binary(
            m,
            OpType::Reshape,
            biased,
            head_shape,
            format!("{prefix}_{branch}_reshape_out"),
        );
        let head = m.intern(format!("{prefix}_{branch}_head"));
        m.add_node(
            Node::new(OpType::Transpose)
                .with_input(split)
                .with_output(head)
                .with_attr_ints("perm", perm),
        )
        .unwrap();
        heads.push(head);
    }
    let q = heads[0];
    let (k, v) = if past {
        let past_k = m.add_input(format!("{prefix}_past_key"));
        let past_v = m.add_input(format!("{prefix}_past_value"));
        let present_k = m.add_output(format!("{prefix}_present_key"));
        let present_v = m.add_output(format!("{prefix}_present_value"));
        m.add_node(
            Node::new(OpType::Concat)
                .with_input(past_k)
                .with_input(heads[1])
                .with_output(present_k)
                .with_attr_i("axis", 3),
        )
        .unwrap();
        m.add_node(
            Node::new(OpType::Concat)
                .with_input(past_v)
                .with_input(heads[2])
                .with_output(present_v)
                .with_attr_i("axis", 2),
        )
        .unwrap();
        (present_k, present_v)
    } else {
        (heads[1], heads[2])
    };

    let scale = scalar(m, format!("{prefix}_qk_scale"), (head_dim as f32).sqrt());
    let scores = binary(m, OpType::MatMul, q, k, format!("{prefix}_qk_out"));
    let scaled = binary(m, OpType::Div, scores, scale, format!("{prefix}_score_out"));
    let attn_in = match mask {
        Some(mask) => binary(m, OpType::Add, scaled, mask, format!("{prefix}_masked_out")),
        None => scaled,
    };
    let probs = m.intern(format!("{prefix}_probs"));
    m.add_node(
        Node::new(OpType::Softmax)
            .with_input(attn_in)
            .with_output(probs)
            .with_attr_i("axis", -1),
    )
    .unwrap();
    let ctx = binary(m, OpType::MatMul, probs, v, format!("{prefix}_ctx_out"));
    let merged = m.intern(format!("{prefix}_ctx_t_out"));
    m.add_node(
        Node::new(OpType::Transpose)
            .with_input(ctx)
            .with_output(merged)
            .with_attr_ints("perm", vec![0, 2, 1, 3]),
    )
    .unwrap();
    binary(m, OpType::Reshape, merged, merge_shape, format!("{prefix}_att_out"))
}

/// Exact gelu as pytorch exports it:
/// `Div(x, √2) -> Erf -> Add(+1) -> Mul(×0.5) -> Mul(×x)`
pub fn erf_gelu_chain(m: &mut GraphModel, prefix: &str, x: TensorId) -> TensorId {
    let sqrt2 = scalar(m, format!("{prefix}_gelu_sqrt2"), std::f32::consts::SQRT_2);
    let one = scalar(m, format!("{prefix}_gelu_one"), 1.0);
    let half = scalar(m, format!("{prefix}_gelu_half"), 0.5);

    let scaled = binary(m, OpType::Div, x, sqrt2, format!("{prefix}_gelu_div_out"));
    let erf = unary(m, OpType::Erf, scaled, format!("{prefix}_gelu_erf_out"));
    let shifted = binary(m, OpType::Add, erf, one, format!("{prefix}_gelu_add_out"));
    let halved = binary(m, OpType::Mul, shifted, half, format!("{prefix}_gelu_mul_out"));
    binary(m, OpType::Mul, halved, x, format!("{prefix}_gelu_out"))
}

/// Tanh-polynomial gelu approximation:
/// `Pow(x, 3) -> Mul(×0.044715) -> Add(+x) -> Mul(×√(2/π)) -> Tanh ->
/// Add(+1) -> Mul(×x) -> Mul(×0.5)`
pub fn tanh_gelu_chain(m: &mut GraphModel, prefix: &str, x: TensorId) -> TensorId {
    let three = scalar(m, format!("{prefix}_gelu_three"), 3.0);
    let coeff = scalar(m, format!("{prefix}_gelu_coeff"), 0.044715);
    let tau = scalar(
        m,
        format!("{prefix}_gelu_tau"),
        (2.0 / std::f32::consts::PI).sqrt(),
    );
    let one = scalar(m, format!("{prefix}_gelu_one"), 1.0);
    let half = scalar(m, format!("{prefix}_gelu_half"), 0.5);

    let cubed = binary(m, OpType::Pow, x, three, format!("{prefix}_gelu_pow_out"));
    let weighted = binary(m, OpType::Mul, cubed, coeff, format!("{prefix}_gelu_cubic_out"));
    let inner = binary(m, OpType::Add, weighted, x, format!("{prefix}_gelu_inner_out"));
    let scaled = binary(m, OpType::Mul, inner, tau, format!("{prefix}_gelu_scaled_out"));
    let tanh = unary(m, OpType::Tanh, scaled, format!("{prefix}_gelu_tanh_out"));
    let shifted = binary(m, OpType::Add, tanh, one, format!("{prefix}_gelu_shift_out"));
    let gated = binary(m, OpType::Mul, shifted, x, format!("{prefix}_gelu_gate_out"));
    binary(m, OpType::Mul, gated, half, format!("{prefix}_gelu_out"))
}

/// 12-layer post-norm encoder, the default exporter convention
///
/// Every residual sum feeds its normalization alone, so a full `Bert`
/// pipeline run fuses all 24 layer normalizations.
pub fn bert_model() -> GraphModel {
    let mut m = GraphModel::new(12, "pytorch");
    let mut x = bert_embedding(&mut m);
    let mask = m.add_input("attention_mask");

    for i in 0..LAYERS {
        let p = format!("l{i}");
        let att = attention_block(&mut m, &p, x, BERT_HIDDEN, Some(mask), false);
        let proj = linear(&mut m, &format!("{p}_out_proj"), att, BERT_HIDDEN, BERT_HIDDEN);
        let att_norm = residual_norm(&mut m, &format!("{p}_att"), proj, x, BERT_HIDDEN);

        let inner = linear(&mut m, &format!("{p}_ffn_inner"), att_norm, BERT_HIDDEN, 4 * BERT_HIDDEN);
        let act = erf_gelu_chain(&mut m, &p, inner);
        let outer = linear(&mut m, &format!("{p}_ffn_outer"), act, 4 * BERT_HIDDEN, BERT_HIDDEN);
        x = residual_norm(&mut m, &format!("{p}_ffn"), outer, att_norm, BERT_HIDDEN);
    }

    let name = m.tensor_name(x).to_string();
    m.add_output(name);
    m
}

/// Pre-norm encoder variant matching the alternate exporter convention
///
/// Each residual sum is read again downstream as the next residual, so
/// residual-normalization fusion never applies and all 24 layer
/// normalizations legitimately stay standalone.
pub fn bert_keras_model() -> GraphModel {
    let mut m = GraphModel::new(12, "keras2onnx");
    let mut x = bert_embedding(&mut m);
    let mask = m.add_input("attention_mask");

    for i in 0..LAYERS {
        let p = format!("l{i}");
        let att_in = layer_norm(&mut m, &format!("{p}_att_pre"), x, BERT_HIDDEN);
        let att = attention_block(&mut m, &p, att_in, BERT_HIDDEN, Some(mask), false);
        let proj = linear(&mut m, &format!("{p}_out_proj"), att, BERT_HIDDEN, BERT_HIDDEN);
        let att_sum = binary(&mut m, OpType::Add, proj, x, format!("{p}_att_sum"));

        let ffn_in = layer_norm(&mut m, &format!("{p}_ffn_pre"), att_sum, BERT_HIDDEN);
        let inner = linear(&mut m, &format!("{p}_ffn_inner"), ffn_in, BERT_HIDDEN, 4 * BERT_HIDDEN);
        let act = erf_gelu_chain(&mut m, &p, inner);
        let outer = linear(&mut m, &format!("{p}_ffn_outer"), act, 4 * BERT_HIDDEN, BERT_HIDDEN);
        x = binary(&mut m, OpType::Add, outer, att_sum, format!("{p}_ffn_sum"));
    }

    let name = m.tensor_name(x).to_string();
    m.add_output(name);
    m
}

/// Decoder-only stack with a trailing normalization
///
/// `with_past` splices per-layer cached key/value state into the
/// attention blocks; fused counts must come out identical either way.
pub fn gpt2_model(with_past: bool) -> GraphModel {
    let mut m = GraphModel::new(12, "pytorch");
    let h = GPT2_HIDDEN as i64;

    let input_ids = m.add_input("input_ids");
    let wte = weight(&mut m, "wte", vec![50, h], 0.01);
    let wpe = weight(&mut m, "wpe", vec![16, h], 0.01);
    let position_ids = m
        .add_initializer(Initializer::i64("position_ids", vec![16], (0..16).collect()))
        .unwrap();

    let token = binary(&mut m, OpType::Gather, wte, input_ids, "token_embed");
    let position = binary(&mut m, OpType::Gather, wpe, position_ids, "position_embed");
    let mut x = binary(&mut m, OpType::Add, token, position, "embed_sum");

    for i in 0..LAYERS {
        let p = format!("l{i}");
        let att_in = layer_norm(&mut m, &format!("{p}_att_pre"), x, GPT2_HIDDEN);
        let att = attention_block(&mut m, &p, att_in, GPT2_HIDDEN, None, with_past);
        let proj = linear(&mut m, &format!("{p}_out_proj"), att, GPT2_HIDDEN, GPT2_HIDDEN);
        let att_sum = binary(&mut m, OpType::Add, proj, x, format!("{p}_att_sum"));

        let ffn_in = layer_norm(&mut m, &format!("{p}_ffn_pre"), att_sum, GPT2_HIDDEN);
        let inner = linear(&mut m, &format!("{p}_ffn_inner"), ffn_in, GPT2_HIDDEN, 4 * GPT2_HIDDEN);
        let act = tanh_gelu_chain(&mut m, &p, inner);
        let outer = linear(&mut m, &format!("{p}_ffn_outer"), act, 4 * GPT2_HIDDEN, GPT2_HIDDEN);
        x = binary(&mut m, OpType::Add, outer, att_sum, format!("{p}_ffn_sum"));
    }

    let out = layer_norm(&mut m, "final", x, GPT2_HIDDEN);
    let name = m.tensor_name(out).to_string();
    m.add_output(name);
    m
}
