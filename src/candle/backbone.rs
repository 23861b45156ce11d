use super::Config;
use super::conv::conv;
use super::restormer::{Downsample, OverlapPatchEmbed, TransformerBlock, Upsample};
use super::sequential::Sequential;
use candle_core::Result;
use candle_core::Tensor;
use candle_nn::{Conv2d, Module, VarBuilder};

/// One-level Restormer encoder/latent/decoder path at full and half
/// resolution.
#[derive(Debug)]
pub struct TransformerBackbone {
    patch_embed: OverlapPatchEmbed,
    encoder_level1: Sequential,
    down1_2: Downsample,
    latent: Sequential,
    up2_1: Upsample,
    reduce_chan_level1: Conv2d,
    decoder_level1: Sequential,
    span: tracing::Span,
}

impl TransformerBackbone {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let level1 = cfg.transformer(cfg.dim, cfg.heads[0]);
        let level2 = cfg.transformer(cfg.dim * 2, cfg.heads[3]);

        let patch_embed = OverlapPatchEmbed::load(vb.pp("patch_embed"), cfg.inp_channels, cfg.dim, false)?;
        let encoder_level1 = Sequential::repeat(vb.pp("encoder_level1"), cfg.num_blocks[0], |vb| {
            TransformerBlock::load(vb, &level1)
        })?;
        let down1_2 = Downsample::load(vb.pp("down1_2"), cfg.dim)?;
        let latent = Sequential::repeat(vb.pp("latent"), cfg.num_blocks[3], |vb| {
            TransformerBlock::load(vb, &level2)
        })?;
        let up2_1 = Upsample::load(vb.pp("up2_1"), cfg.dim * 2)?;
        let reduce_chan_level1 = conv(vb.pp("reduce_chan_level1"), cfg.dim * 2, cfg.dim, 1, 1, cfg.bias)?;
        let decoder_level1 = Sequential::repeat(vb.pp("decoder_level1"), cfg.num_blocks[0], |vb| {
            TransformerBlock::load(vb, &level1)
        })?;
        Ok(Self {
            patch_embed,
            encoder_level1,
            down1_2,
            latent,
            up2_1,
            reduce_chan_level1,
            decoder_level1,
            span: tracing::span!(tracing::Level::TRACE, "backbone"),
        })
    }
}

impl Module for TransformerBackbone {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let enc = self.encoder_level1.forward(&self.patch_embed.forward(xs)?)?;
        let latent = self.latent.forward(&self.down1_2.forward(&enc)?)?;
        let dec = Tensor::cat(&[&self.up2_1.forward(&latent)?, &enc], 1)?;
        let dec = self.reduce_chan_level1.forward(&dec)?;
        self.decoder_level1.forward(&dec)
    }
}
