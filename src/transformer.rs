use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use crate::config::{FissaConfig, HiddenAct};

/// Additive bias applied to attention scores at padding keys.
pub const MASK_BIAS: f64 = -10000.0;

// ---------------------------------------------------------------------------
// Gradient-safe LayerNorm (the fused candle_nn kernel has no backward pass)
// Uses only basic tensor ops that have working autograd.
// ---------------------------------------------------------------------------

pub struct GradLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl GradLayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (variance + self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&std)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

// ---------------------------------------------------------------------------
// Gradient-safe softmax
// ---------------------------------------------------------------------------

pub fn grad_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let exp = shifted.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum)
}

// ---------------------------------------------------------------------------
// Padding Mask
// ---------------------------------------------------------------------------

/// Bidirectional padding mask for `item_seq` of shape `(B, L)`.
///
/// Returns `(B, 1, 1, L)`: 0 where the item id is non-zero, [`MASK_BIAS`]
/// at padding. No causal structure: every real position sees every other
/// real position.
pub fn padding_mask(item_seq: &Tensor) -> Result<Tensor> {
    let (b, l) = item_seq.dims2()?;
    let attendable = item_seq.ne(0u32)?.to_dtype(DType::F32)?;
    // 1 -> 0, 0 -> MASK_BIAS
    attendable
        .affine(-MASK_BIAS, MASK_BIAS)?
        .reshape((b, 1, 1, l))
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dense: Linear,
    layer_norm: GradLayerNorm,
    attn_dropout: Dropout,
    out_dropout: Dropout,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    fn new(cfg: &FissaConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.hidden_size;
        Ok(Self {
            query: linear(d, d, vb.pp("query"))?,
            key: linear(d, d, vb.pp("key"))?,
            value: linear(d, d, vb.pp("value"))?,
            dense: linear(d, d, vb.pp("dense"))?,
            layer_norm: GradLayerNorm::new(d, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            attn_dropout: Dropout::new(cfg.attn_dropout_prob),
            out_dropout: Dropout::new(cfg.hidden_dropout_prob),
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        x.reshape((b, s, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        let q = self.split_heads(&self.query.forward(x)?)?;
        let k = self.split_heads(&self.key.forward(x)?)?;
        let v = self.split_heads(&self.value.forward(x)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let attn = (attn / scale)?;
        let attn = attn.broadcast_add(mask)?;
        let attn = grad_softmax_last_dim(&attn)?;
        let attn = self.attn_dropout.forward(&attn, train)?;

        let out = attn.matmul(&v)?;
        let out = out
            .transpose(1, 2)?
            .reshape((b, s, self.n_heads * self.head_dim))?;
        let out = self.dense.forward(&out)?;
        let out = self.out_dropout.forward(&out, train)?;
        self.layer_norm.forward(&(out + x)?)
    }
}

// ---------------------------------------------------------------------------
// Feed Forward
// ---------------------------------------------------------------------------

struct FeedForward {
    dense_1: Linear,
    dense_2: Linear,
    act: HiddenAct,
    layer_norm: GradLayerNorm,
    dropout: Dropout,
}

impl FeedForward {
    fn new(cfg: &FissaConfig, act: HiddenAct, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense_1: linear(cfg.hidden_size, cfg.inner_size, vb.pp("dense_1"))?,
            dense_2: linear(cfg.inner_size, cfg.hidden_size, vb.pp("dense_2"))?,
            act,
            layer_norm: GradLayerNorm::new(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            dropout: Dropout::new(cfg.hidden_dropout_prob),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.act.apply(&self.dense_1.forward(x)?)?;
        let h = self.dense_2.forward(&h)?;
        let h = self.dropout.forward(&h, train)?;
        self.layer_norm.forward(&(h + x)?)
    }
}

// ---------------------------------------------------------------------------
// Transformer Layer / Encoder
// ---------------------------------------------------------------------------

struct TransformerLayer {
    attn: MultiHeadAttention,
    ffn: FeedForward,
}

impl TransformerLayer {
    fn new(cfg: &FissaConfig, act: HiddenAct, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(cfg, vb.pp("multi_head_attention"))?,
            ffn: FeedForward::new(cfg, act, vb.pp("feed_forward"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.attn.forward(x, mask, train)?;
        self.ffn.forward(&h, train)
    }
}

/// Stack of post-norm self-attention layers.
pub struct TransformerEncoder {
    layers: Vec<TransformerLayer>,
}

impl TransformerEncoder {
    pub fn new(cfg: &FissaConfig, act: HiddenAct, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            layers.push(TransformerLayer::new(cfg, act, vb.pp(format!("layer_{i}")))?);
        }
        Ok(Self { layers })
    }

    /// Run every layer with the additive `mask` and return each layer's output.
    /// hidden: (B, L, D), mask: (B, 1, 1, L)
    pub fn forward(&self, hidden: &Tensor, mask: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut all = Vec::with_capacity(self.layers.len());
        let mut x = hidden.clone();
        for layer in &self.layers {
            x = layer.forward(&x, mask, train)?;
            all.push(x.clone());
        }
        Ok(all)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
