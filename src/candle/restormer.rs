//! Restormer building blocks: channel-wise layer norm, multi-Dconv head
//! transposed attention, gated-Dconv feed-forward and the resampling layers
//! around them.
use super::conv::conv;
use super::op::TensorOps;
use candle_core::{Result, Tensor};
use candle_nn::ops::{pixel_shuffle, pixel_unshuffle, softmax_last_dim};
use candle_nn::{Conv2d, Init, Module, VarBuilder};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LayerNormKind {
    /// Scale only, no re-centering of the output.
    BiasFree,
    #[default]
    WithBias,
}

/// Layer norm over the channel axis of a `(B, C, H, W)` map.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Option<Tensor>,
    span: tracing::Span,
}

impl LayerNorm {
    pub fn load(vb: VarBuilder, dim: usize, kind: LayerNormKind) -> Result<Self> {
        let vb = vb.pp("body");
        let weight = vb
            .get_with_hints(dim, "weight", Init::Const(1.))?
            .reshape((1, dim, 1, 1))?;
        let bias = match kind {
            LayerNormKind::BiasFree => None,
            LayerNormKind::WithBias => Some(
                vb.get_with_hints(dim, "bias", Init::Const(0.))?
                    .reshape((1, dim, 1, 1))?,
            ),
        };
        Ok(Self {
            weight,
            bias,
            span: tracing::span!(tracing::Level::TRACE, "layer-norm"),
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let centered = xs.broadcast_sub(&xs.mean_keepdim(1)?)?;
        let std = (centered.sqr()?.mean_keepdim(1)? + 1e-5)?.sqrt()?;
        match &self.bias {
            Some(bias) => centered
                .broadcast_div(&std)?
                .broadcast_mul(&self.weight)?
                .broadcast_add(bias),
            None => xs.broadcast_div(&std)?.broadcast_mul(&self.weight),
        }
    }
}

/// Self-attention across channels: each head attends over its `C/heads`
/// channel vectors of length `H*W`, so cost grows linearly with resolution.
#[derive(Clone, Debug)]
pub struct MultiDconvHeadAttention {
    num_heads: usize,
    temperature: Tensor,
    qkv: Conv2d,
    qkv_dwconv: Conv2d,
    project_out: Conv2d,
    span: tracing::Span,
}

impl MultiDconvHeadAttention {
    pub fn load(vb: VarBuilder, dim: usize, num_heads: usize, bias: bool) -> Result<Self> {
        let temperature = vb.get_with_hints((num_heads, 1, 1), "temperature", Init::Const(1.))?;
        Ok(Self {
            num_heads,
            temperature,
            qkv: conv(vb.pp("qkv"), dim, dim * 3, 1, 1, bias)?,
            qkv_dwconv: conv(vb.pp("qkv_dwconv"), dim * 3, dim * 3, 3, dim * 3, bias)?,
            project_out: conv(vb.pp("project_out"), dim, dim, 1, 1, bias)?,
            span: tracing::span!(tracing::Level::TRACE, "mdta"),
        })
    }
}

impl Module for MultiDconvHeadAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, c, h, w) = xs.dims4()?;
        let qkv = self.qkv_dwconv.forward(&self.qkv.forward(xs)?)?;
        let heads = |i: usize| {
            qkv.narrow(1, i * c, c)?
                .reshape((b, self.num_heads, c / self.num_heads, h * w))
        };
        let q = heads(0)?.l2_normalize_last_dim()?;
        let k = heads(1)?.l2_normalize_last_dim()?;
        let v = heads(2)?.contiguous()?;

        let attn = q
            .matmul(&k.t()?.contiguous()?)?
            .broadcast_mul(&self.temperature)?;
        let attn = softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?.reshape((b, c, h, w))?;
        self.project_out.forward(&out)
    }
}

/// Feed-forward with a depthwise 3x3 stage and a GELU gate.
#[derive(Clone, Debug)]
pub struct GatedDconvFeedForward {
    hidden: usize,
    project_in: Conv2d,
    dwconv: Conv2d,
    project_out: Conv2d,
    span: tracing::Span,
}

impl GatedDconvFeedForward {
    pub fn load(vb: VarBuilder, dim: usize, expansion: f64, bias: bool) -> Result<Self> {
        let hidden = (dim as f64 * expansion) as usize;
        Ok(Self {
            hidden,
            project_in: conv(vb.pp("project_in"), dim, hidden * 2, 1, 1, bias)?,
            dwconv: conv(vb.pp("dwconv"), hidden * 2, hidden * 2, 3, hidden * 2, bias)?,
            project_out: conv(vb.pp("project_out"), hidden, dim, 1, 1, bias)?,
            span: tracing::span!(tracing::Level::TRACE, "gdfn"),
        })
    }
}

impl Module for GatedDconvFeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.dwconv.forward(&self.project_in.forward(xs)?)?;
        let x1 = xs.narrow(1, 0, self.hidden)?;
        let x2 = xs.narrow(1, self.hidden, self.hidden)?;
        self.project_out.forward(&(x1.gelu_erf()? * x2)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformerConfig {
    pub dim: usize,
    pub num_heads: usize,
    pub ffn_expansion_factor: f64,
    pub bias: bool,
    pub layer_norm: LayerNormKind,
}

/// Pre-norm block: `x + attn(norm1(x))` followed by `x + ffn(norm2(x))`.
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    norm1: LayerNorm,
    attn: MultiDconvHeadAttention,
    norm2: LayerNorm,
    ffn: GatedDconvFeedForward,
    span: tracing::Span,
}

impl TransformerBlock {
    pub fn load(vb: VarBuilder, cfg: &TransformerConfig) -> Result<Self> {
        Ok(Self {
            norm1: LayerNorm::load(vb.pp("norm1"), cfg.dim, cfg.layer_norm)?,
            attn: MultiDconvHeadAttention::load(vb.pp("attn"), cfg.dim, cfg.num_heads, cfg.bias)?,
            norm2: LayerNorm::load(vb.pp("norm2"), cfg.dim, cfg.layer_norm)?,
            ffn: GatedDconvFeedForward::load(
                vb.pp("ffn"),
                cfg.dim,
                cfg.ffn_expansion_factor,
                cfg.bias,
            )?,
            span: tracing::span!(tracing::Level::TRACE, "transformer-block"),
        })
    }
}

impl Module for TransformerBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        &xs + self.ffn.forward(&self.norm2.forward(&xs)?)?
    }
}

/// 3x3 convolution from image channels to the embedding width.
#[derive(Clone, Debug)]
pub struct OverlapPatchEmbed {
    proj: Conv2d,
}

impl OverlapPatchEmbed {
    pub fn load(vb: VarBuilder, in_c: usize, embed_dim: usize, bias: bool) -> Result<Self> {
        Ok(Self {
            proj: conv(vb.pp("proj"), in_c, embed_dim, 3, 1, bias)?,
        })
    }
}

impl Module for OverlapPatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.proj.forward(xs)
    }
}

/// Halves H and W, doubles the channels: conv to `n/2` then pixel-unshuffle.
#[derive(Clone, Debug)]
pub struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub fn load(vb: VarBuilder, n_feat: usize) -> Result<Self> {
        Ok(Self {
            conv: conv(vb.pp("body.0"), n_feat, n_feat / 2, 3, 1, false)?,
        })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        pixel_unshuffle(&self.conv.forward(xs)?, 2)
    }
}

/// Doubles H and W, halves the channels: conv to `2n` then pixel-shuffle.
#[derive(Clone, Debug)]
pub struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    pub fn load(vb: VarBuilder, n_feat: usize) -> Result<Self> {
        Ok(Self {
            conv: conv(vb.pp("body.0"), n_feat, n_feat * 2, 3, 1, false)?,
        })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        pixel_shuffle(&self.conv.forward(xs)?, 2)
    }
}
