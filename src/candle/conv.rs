use candle_core::Result;
use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder, conv2d, conv2d_no_bias};

/// Pointwise non-linearity fused after a convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
        }
    }
}

/// Stride-1 convolution with "same" padding for odd kernel sizes.
pub(crate) fn conv(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    k: usize,
    groups: usize,
    bias: bool,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: k / 2,
        groups,
        ..Default::default()
    };
    if bias {
        conv2d(c1, c2, k, cfg, vb)
    } else {
        conv2d_no_bias(c1, c2, k, cfg, vb)
    }
}

/// Bias-free 1x1 convolution.
pub fn conv1x1(vb: VarBuilder, c1: usize, c2: usize) -> Result<Conv2d> {
    conv(vb, c1, c2, 1, 1, false)
}

/// Bias-free 3x3 convolution, padding 1.
pub fn conv3x3(vb: VarBuilder, c1: usize, c2: usize) -> Result<Conv2d> {
    conv(vb, c1, c2, 3, 1, false)
}

#[derive(Clone, Debug)]
pub struct ConvBlock {
    conv: Conv2d,
    act: Option<Activation>,
    span: tracing::Span,
}

impl ConvBlock {
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        k: usize,
        bias: bool,
        act: Option<Activation>,
    ) -> Result<Self> {
        let conv = conv(vb, c1, c2, k, 1, bias)?;
        Ok(Self {
            conv,
            act,
            span: tracing::span!(tracing::Level::TRACE, "conv-block"),
        })
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.conv.forward(xs)?;
        match &self.act {
            Some(act) => act.apply(&xs),
            None => Ok(xs),
        }
    }
}
