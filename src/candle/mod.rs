pub use candle_nn::{VarBuilder, VarMap};
pub use candle_core::{Result, Tensor, DType, Device};
use candle_core::Error;
use candle_nn::Module;

use crate::candle::{
    backbone::TransformerBackbone,
    conv::conv3x3,
    init::WeightInit,
    op::FftNorm,
    refine::{RefineChain, RefineSchedule},
    restormer::{LayerNormKind, TransformerConfig},
    sam::{DirectionGating, Sam},
    sequential::{seq, Sequential},
};

pub mod block;
pub mod conv;
pub mod sequential;
pub mod backbone;
pub mod generator;
pub mod init;
pub mod refine;
pub mod restormer;
pub mod sam;
pub mod op;
mod fft;

/// Hyper-parameters of [`SpaNet`]. Only levels 0 and 3 of `num_blocks` and
/// `heads` are used: the transformer path has a single down/up level whose
/// latent stage takes the deepest settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    pub inp_channels: usize,
    pub out_channels: usize,
    /// Width of both the convolutional stem and the transformer path.
    pub dim: usize,
    pub num_blocks: [usize; 4],
    pub heads: [usize; 4],
    pub ffn_expansion_factor: f64,
    pub bias: bool,
    pub layer_norm: LayerNormKind,
    pub fft_norm: FftNorm,
    pub gating: DirectionGating,
    pub schedule: RefineSchedule,
}

impl Default for Config {
    fn default() -> Self {
        Self::spa_former()
    }
}

impl Config {
    // inp_channels=3, out_channels=3, dim=32, num_blocks=[4,6,6,8], heads=[1,2,4,8]
    pub fn spa_former() -> Self {
        Self {
            inp_channels: 3,
            out_channels: 3,
            dim: 32,
            num_blocks: [4, 6, 6, 8],
            heads: [1, 2, 4, 8],
            ffn_expansion_factor: 2.66,
            bias: false,
            layer_norm: LayerNormKind::WithBias,
            fft_norm: FftNorm::Backward,
            gating: DirectionGating::Inert,
            schedule: RefineSchedule::default(),
        }
    }

    /// Narrow and shallow variant with the full refinement schedule, for
    /// smoke tests.
    pub fn tiny() -> Self {
        Self {
            dim: 8,
            num_blocks: [1, 1, 1, 1],
            heads: [1, 1, 1, 2],
            ..Self::spa_former()
        }
    }

    pub(crate) fn transformer(&self, dim: usize, num_heads: usize) -> TransformerConfig {
        TransformerConfig {
            dim,
            num_heads,
            ffn_expansion_factor: self.ffn_expansion_factor,
            bias: self.bias,
            layer_norm: self.layer_norm,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Msg(msg));
        if self.inp_channels == 0 || self.out_channels == 0 {
            return fail(format!("channel counts must be positive, got {self:?}"));
        }
        if self.dim == 0 || self.dim % 2 != 0 {
            return fail(format!("dim must be a positive even number, got {}", self.dim));
        }
        for (width, heads) in [(self.dim, self.heads[0]), (self.dim * 2, self.heads[3])] {
            if heads == 0 || width % heads != 0 {
                return fail(format!("{heads} heads do not divide width {width}"));
            }
        }
        if self.ffn_expansion_factor <= 0.0 {
            return fail(format!(
                "ffn_expansion_factor must be positive, got {}",
                self.ffn_expansion_factor
            ));
        }
        self.schedule.validate()
    }
}

/// Spatial-attention deraining network.
///
/// A convolutional stem and a transformer path run side by side on the input,
/// are summed, refined by a chain of residual + spectral blocks gated by SAM
/// masks, and projected back to image channels.
#[derive(Debug)]
pub struct SpaNet {
    conv_in: Sequential,
    conv_in1: Sequential,
    conv_in2: Sequential,
    sam: Sam,
    backbone: TransformerBackbone,
    refine: RefineChain,
    conv_out: Sequential,
    span: tracing::Span,
}

impl SpaNet {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        tracing::debug!(?cfg, "loading SPANet");
        let stem = |name: &str, c1: usize| -> Result<Sequential> {
            Ok(seq()
                .add(conv3x3(vb.pp(name).pp("0"), c1, cfg.dim)?)
                .add_fn(|xs| xs.relu()))
        };
        let conv_in = stem("conv_in", cfg.inp_channels)?;
        let conv_in1 = stem("conv_in1", cfg.dim)?;
        let conv_in2 = stem("conv_in2", cfg.dim)?;
        let sam = Sam::load(vb.pp("SAM1"), cfg.dim, cfg.dim, cfg.gating)?;
        let backbone = TransformerBackbone::load(vb.clone(), cfg)?;
        let refine = RefineChain::load(vb.clone(), cfg.dim, cfg.schedule, cfg.fft_norm)?;
        let conv_out = seq().add(conv3x3(vb.pp("conv_out.0"), cfg.dim, cfg.out_channels)?);
        Ok(Self {
            conv_in,
            conv_in1,
            conv_in2,
            sam,
            backbone,
            refine,
            conv_out,
            span: tracing::span!(tracing::Level::TRACE, "spanet"),
        })
    }

    /// Creates fresh parameters in a new [`VarMap`] and initialises them with
    /// [`WeightInit`] seeded by `seed`.
    pub fn init(cfg: &Config, seed: u64, device: &Device) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::load(vb, cfg)?;
        WeightInit::new(seed).apply(&varmap)?;
        Ok((model, varmap))
    }

    pub fn schedule(&self) -> RefineSchedule {
        self.refine.schedule()
    }

    /// Returns `(mask, image)`: the mask of the last SAM evaluation,
    /// `(B, 1, H, W)`, and the restored image, `(B, out_channels, H, W)`.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (_b_size, _channels, h, w) = xs.dims4()?;
        if h % 2 != 0 || w % 2 != 0 {
            return Err(Error::Msg(format!(
                "input height and width must be even, got {h}x{w}"
            )));
        }
        let stem = self
            .conv_in2
            .forward(&self.conv_in1.forward(&self.conv_in.forward(xs)?)?)?;
        let out = (self.backbone.forward(xs)? + stem)?;
        let (mask, out) = self.refine.forward(&out, &self.sam)?;
        Ok((mask, self.conv_out.forward(&out)?))
    }
}
