use super::conv::{Activation, ConvBlock, conv1x1, conv3x3};
use super::op::{FftNorm, SpectralOps, Spectrum};
use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Module, VarBuilder};

/// Two 3x3 convolutions with a ReLU in between. The caller adds the residual
/// and applies the outer activation.
#[derive(Clone, Debug)]
pub struct ResBlock {
    conv1: ConvBlock,
    conv2: Conv2d,
    span: tracing::Span,
}

impl ResBlock {
    pub fn load(vb: VarBuilder, c1: usize, c2: usize) -> Result<Self> {
        let vb = vb.pp("main");
        let conv1 = ConvBlock::load(vb.pp("conv1"), c1, c2, 3, false, Some(Activation::Relu))?;
        // the second conv reads c1 channels, so c1 == c2 in practice
        let conv2 = conv3x3(vb.pp("conv2"), c1, c2)?;
        Ok(Self {
            conv1,
            conv2,
            span: tracing::span!(tracing::Level::TRACE, "res-block"),
        })
    }
}

impl Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.conv2.forward(&self.conv1.forward(xs)?)
    }
}

/// Residual branch working on the 2D real spectrum of its input.
///
/// Real and imaginary parts are stacked on the channel axis, mixed by two 1x1
/// convolutions and transformed back at the input resolution.
#[derive(Clone, Debug)]
pub struct FftResBlock {
    conv1: ConvBlock,
    conv2: Conv2d,
    norm: FftNorm,
    span: tracing::Span,
}

impl FftResBlock {
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, norm: FftNorm) -> Result<Self> {
        let vb = vb.pp("main_fft");
        let conv1 = ConvBlock::load(
            vb.pp("conv1"),
            c1 * 2,
            c2 * 2,
            1,
            false,
            Some(Activation::Relu),
        )?;
        let conv2 = conv1x1(vb.pp("conv2"), c1 * 2, c2 * 2)?;
        Ok(Self {
            conv1,
            conv2,
            norm,
            span: tracing::span!(tracing::Level::TRACE, "fft-res-block"),
        })
    }
}

impl Module for FftResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b, _c, h, w) = xs.dims4()?;
        let ys = xs.rfft2(self.norm)?.stacked(1)?;
        let ys = self.conv2.forward(&self.conv1.forward(&ys)?)?;
        Spectrum::from_stacked(&ys, 1)?.irfft2((h, w), self.norm)
    }
}
