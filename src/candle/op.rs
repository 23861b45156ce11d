use std::str::FromStr;

use candle_core::{D, Error, Result, Tensor};

use super::fft;

/// Scaling convention of a forward/inverse transform pair, named after the
/// direction that carries the `1/n` factor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FftNorm {
    /// No scaling forward, `1/n` on the inverse.
    #[default]
    Backward,
    /// `1/n` forward, no scaling on the inverse.
    Forward,
    /// `1/sqrt(n)` both ways.
    Ortho,
}

impl FftNorm {
    fn forward_scale(&self, n: usize) -> f64 {
        match self {
            FftNorm::Backward => 1.0,
            FftNorm::Forward => 1.0 / n as f64,
            FftNorm::Ortho => 1.0 / (n as f64).sqrt(),
        }
    }

    fn inverse_scale(&self, n: usize) -> f64 {
        match self {
            FftNorm::Backward => 1.0 / n as f64,
            FftNorm::Forward => 1.0,
            FftNorm::Ortho => 1.0 / (n as f64).sqrt(),
        }
    }
}

impl FromStr for FftNorm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backward" => Ok(FftNorm::Backward),
            "forward" => Ok(FftNorm::Forward),
            "ortho" => Ok(FftNorm::Ortho),
            other => Err(Error::Msg(format!("unknown fft norm {other:?}"))),
        }
    }
}

/// Half spectrum of a real signal over the last two dims: `(.., H, W/2 + 1)`.
#[derive(Clone, Debug)]
pub struct Spectrum {
    pub re: Tensor,
    pub im: Tensor,
}

/// 2D real-input discrete Fourier transforms over the last two dims, backed
/// by rustfft and differentiable through their adjoints.
pub trait SpectralOps {
    /// Equivalent to `torch.fft.rfft2(x, norm)`.
    fn rfft2(&self, norm: FftNorm) -> Result<Spectrum>;
}

impl SpectralOps for Tensor {
    fn rfft2(&self, norm: FftNorm) -> Result<Spectrum> {
        let h = self.dim(D::Minus2)?;
        let w = self.dim(D::Minus1)?;
        let ys = fft::rfft2(self, norm.forward_scale(h * w))?;
        Ok(Spectrum {
            re: ys.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?,
            im: ys.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?,
        })
    }
}

impl Spectrum {
    /// Recombines real and imaginary halves stacked on `dim`, the inverse of
    /// `Tensor::cat(&[re, im], dim)`.
    pub fn from_stacked(xs: &Tensor, dim: usize) -> Result<Self> {
        let chunks = xs.chunk(2, dim)?;
        match chunks.as_slice() {
            [re, im] => Ok(Self {
                re: re.clone(),
                im: im.clone(),
            }),
            _ => Err(Error::Msg(format!(
                "cannot split {:?} into real and imaginary halves on dim {dim}",
                xs.shape()
            ))),
        }
    }

    /// Real and imaginary halves concatenated on `dim`.
    pub fn stacked(&self, dim: usize) -> Result<Tensor> {
        Tensor::cat(&[&self.re, &self.im], dim)
    }

    /// Equivalent to `torch.fft.irfft2(spectrum, s=(h, w), norm)`.
    ///
    /// The width of the half spectrum is trimmed or zero padded to `w/2 + 1`
    /// bins, so odd and even target widths are both reconstructed exactly.
    /// Imaginary parts of the DC and Nyquist columns are dropped, as in a
    /// c2r transform.
    pub fn irfft2(&self, (h, w): (usize, usize), norm: FftNorm) -> Result<Tensor> {
        let rows = self.re.dim(D::Minus2)?;
        if rows != h {
            return Err(Error::Msg(format!(
                "irfft2: spectrum has {rows} rows, target height is {h}"
            )));
        }
        let bins = w / 2 + 1;
        let fit = |xs: &Tensor| -> Result<Tensor> {
            let have = xs.dim(D::Minus1)?;
            if have > bins {
                xs.narrow(D::Minus1, 0, bins)
            } else if have < bins {
                xs.pad_with_zeros(D::Minus1, 0, bins - have)
            } else {
                Ok(xs.clone())
            }
        };
        let spectrum = Tensor::stack(&[fit(&self.re)?, fit(&self.im)?], D::Minus1)?;
        fft::irfft2(&spectrum, w, norm.inverse_scale(h * w))
    }
}

/// Extension trait for Tensor operations
pub trait TensorOps {
    /// Divides by the L2 norm of the last dim, clamped below at `1e-12`, like
    /// `torch.nn.functional.normalize(x, dim=-1)`.
    fn l2_normalize_last_dim(&self) -> Result<Tensor>;
}

impl TensorOps for Tensor {
    fn l2_normalize_last_dim(&self) -> Result<Tensor> {
        let norm = self.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
        self.broadcast_div(&norm)
    }
}
