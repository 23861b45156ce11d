//! Spatial attention: a two-hop, four-direction recurrence over the feature
//! map that collapses into a single-channel mask.
use super::conv::{Activation, ConvBlock, conv};
use candle_core::{Error, Result, Tensor};
use candle_nn::{Conv2d, Module, VarBuilder};

/// The four maps produced by one [`IrnnLayer`] hop.
#[derive(Clone, Debug)]
pub struct DirectionMaps {
    pub up: Tensor,
    pub right: Tensor,
    pub down: Tensor,
    pub left: Tensor,
}

impl DirectionMaps {
    /// Scales each map by its gate channel of `weight`, channels ordered
    /// up, right, down, left.
    pub fn gated(&self, weight: &Tensor) -> Result<Self> {
        let gate = |xs: &Tensor, i: usize| xs.broadcast_mul(&weight.narrow(1, i, 1)?);
        Ok(Self {
            up: gate(&self.up, 0)?,
            right: gate(&self.right, 1)?,
            down: gate(&self.down, 2)?,
            left: gate(&self.left, 3)?,
        })
    }

    /// Channel concatenation in up, right, down, left order.
    pub fn concat(&self) -> Result<Tensor> {
        Tensor::cat(&[&self.up, &self.right, &self.down, &self.left], 1)
    }
}

/// Which end of the hop axis keeps the raw input.
#[derive(Clone, Copy, Debug)]
enum Keep {
    First,
    Last,
}

/// One recurrence step along `dim`: every position except the kept boundary
/// becomes `relu(weight(x)[prev] + x)`.
fn hop(xs: &Tensor, weight: &Conv2d, dim: usize, keep: Keep) -> Result<Tensor> {
    let n = xs.dim(dim)?;
    if n < 2 {
        return Ok(xs.clone());
    }
    let ys = weight.forward(xs)?;
    match keep {
        Keep::First => {
            let moved = (ys.narrow(dim, 0, n - 1)? + xs.narrow(dim, 1, n - 1)?)?.relu()?;
            Tensor::cat(&[&xs.narrow(dim, 0, 1)?, &moved], dim)
        }
        Keep::Last => {
            let moved = (ys.narrow(dim, 1, n - 1)? + xs.narrow(dim, 0, n - 1)?)?.relu()?;
            Tensor::cat(&[&moved, &xs.narrow(dim, n - 1, 1)?], dim)
        }
    }
}

/// Four-directional recurrence with a depthwise 1x1 convolution per direction.
#[derive(Clone, Debug)]
pub struct IrnnLayer {
    left_weight: Conv2d,
    right_weight: Conv2d,
    up_weight: Conv2d,
    down_weight: Conv2d,
    span: tracing::Span,
}

impl IrnnLayer {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        let depthwise = |name: &str| conv(vb.pp(name), channels, channels, 1, channels, true);
        Ok(Self {
            left_weight: depthwise("left_weight")?,
            right_weight: depthwise("right_weight")?,
            up_weight: depthwise("up_weight")?,
            down_weight: depthwise("down_weight")?,
            span: tracing::span!(tracing::Level::TRACE, "irnn"),
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<DirectionMaps> {
        let _enter = self.span.enter();
        Ok(DirectionMaps {
            up: hop(xs, &self.up_weight, 2, Keep::First)?,
            right: hop(xs, &self.right_weight, 3, Keep::Last)?,
            down: hop(xs, &self.down_weight, 2, Keep::Last)?,
            left: hop(xs, &self.left_weight, 3, Keep::First)?,
        })
    }
}

/// Per-pixel gates in `[0, 1]` for the four propagation directions.
#[derive(Clone, Debug)]
pub struct DirectionAttention {
    conv1: ConvBlock,
    conv2: ConvBlock,
    conv3: ConvBlock,
    span: tracing::Span,
}

impl DirectionAttention {
    pub fn load(vb: VarBuilder, in_channels: usize) -> Result<Self> {
        let c_ = in_channels / 2;
        let relu = Some(Activation::Relu);
        Ok(Self {
            conv1: ConvBlock::load(vb.pp("conv1"), in_channels, c_, 3, true, relu)?,
            conv2: ConvBlock::load(vb.pp("conv2"), c_, c_, 3, true, relu)?,
            conv3: ConvBlock::load(vb.pp("conv3"), c_, 4, 1, true, Some(Activation::Sigmoid))?,
            span: tracing::span!(tracing::Level::TRACE, "direction-attention"),
        })
    }
}

impl Module for DirectionAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.conv1.forward(xs)?;
        let xs = self.conv2.forward(&xs)?;
        self.conv3.forward(&xs)
    }
}

/// How the direction gates of [`Sam`] take part in the forward pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DirectionGating {
    /// No attention layer at all.
    Off,
    /// The attention layer exists (its weights load) but the directional maps
    /// are left ungated. Matches the published SpA-Former checkpoints.
    #[default]
    Inert,
    /// Directional maps are scaled by their gates before concatenation.
    On,
}

/// Spatial attention module producing a `(B, 1, H, W)` mask in `[0, 1]`.
#[derive(Clone, Debug)]
pub struct Sam {
    irnn1: IrnnLayer,
    irnn2: IrnnLayer,
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: ConvBlock,
    conv_out: ConvBlock,
    attention: Option<DirectionAttention>,
    gating: DirectionGating,
    span: tracing::Span,
}

impl Sam {
    /// `conv1` consumes the raw input, so the module only wires up when
    /// `in_channels == out_channels`.
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        gating: DirectionGating,
    ) -> Result<Self> {
        if in_channels != out_channels {
            return Err(Error::Msg(format!(
                "SAM needs in_channels == out_channels, got {in_channels} and {out_channels}"
            )));
        }
        let c = out_channels;
        let attention = match gating {
            DirectionGating::Off => None,
            DirectionGating::Inert | DirectionGating::On => Some(DirectionAttention::load(
                vb.pp("attention_layer"),
                in_channels,
            )?),
        };
        tracing::debug!(channels = c, ?gating, "loading SAM");
        Ok(Self {
            irnn1: IrnnLayer::load(vb.pp("irnn1"), c)?,
            irnn2: IrnnLayer::load(vb.pp("irnn2"), c)?,
            conv1: conv(vb.pp("conv1"), c, c, 1, 1, true)?,
            conv2: conv(vb.pp("conv2"), c * 4, c, 1, 1, true)?,
            conv3: ConvBlock::load(vb.pp("conv3"), c * 4, c, 1, true, Some(Activation::Relu))?,
            conv_out: ConvBlock::load(vb.pp("conv_out"), c, 1, 1, false, Some(Activation::Sigmoid))?,
            attention,
            gating,
            span: tracing::span!(tracing::Level::TRACE, "sam"),
        })
    }

    pub fn gating(&self) -> DirectionGating {
        self.gating
    }
}

impl Module for Sam {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let weight = match (self.gating, &self.attention) {
            (DirectionGating::On, Some(attention)) => Some(attention.forward(xs)?),
            _ => None,
        };
        let gate = |maps: DirectionMaps| match &weight {
            Some(weight) => maps.gated(weight),
            None => Ok(maps),
        };

        let out = self.conv1.forward(xs)?;
        let maps = gate(self.irnn1.forward(&out)?)?;
        let out = self.conv2.forward(&maps.concat()?)?;
        let maps = gate(self.irnn2.forward(&out)?)?;
        let out = self.conv3.forward(&maps.concat()?)?;
        self.conv_out.forward(&out)
    }
}
