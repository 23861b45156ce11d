//! rustfft-backed 2D real transforms as candle custom ops.
//!
//! Spectra are laid out as `(.., H, W/2 + 1, 2)` with the real and imaginary
//! parts interleaved on the last axis. Kernels run on the CPU; tensors on
//! other devices are staged through host memory.
use std::cell::RefCell;

use candle_core::{CpuStorage, CustomOp1, DType, Device, Error, Layout, Result, Shape, Tensor, bail};
use rustfft::{FftPlanner, num_complex::Complex};
use tracing::instrument;

thread_local! {
    static PLANNER: RefCell<FftPlanner<f32>> = RefCell::new(FftPlanner::new());
}

/// Unnormalised in-place 2D transform of a row-major `h x w` plane.
fn fft2_plane(plane: &mut [Complex<f32>], h: usize, w: usize, inverse: bool) {
    PLANNER.with(|p| {
        let mut planner = p.borrow_mut();
        let (rows, cols) = if inverse {
            (planner.plan_fft_inverse(w), planner.plan_fft_inverse(h))
        } else {
            (planner.plan_fft_forward(w), planner.plan_fft_forward(h))
        };
        rows.process(plane);
        let mut col = vec![Complex::default(); h];
        for c in 0..w {
            for (r, v) in col.iter_mut().enumerate() {
                *v = plane[r * w + c];
            }
            cols.process(&mut col);
            for (r, v) in col.iter().enumerate() {
                plane[r * w + c] = *v;
            }
        }
    });
}

fn contiguous_f32<'a>(storage: &'a CpuStorage, layout: &Layout) -> Result<&'a [f32]> {
    let data = storage.as_slice::<f32>()?;
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => bail!("fft kernels need a contiguous input"),
    }
}

/// Hermitian weight of half-spectrum bin `l`: DC and the even-width Nyquist
/// bin stand alone, every other bin also stands for its mirror.
fn bin_weight(l: usize, w: usize) -> f32 {
    if l == 0 || (w % 2 == 0 && l == w / 2) { 1.0 } else { 2.0 }
}

/// The first `keep` dims of `dims` followed by `tail`.
fn with_plane(dims: &[usize], keep: usize, tail: &[usize]) -> Shape {
    let mut dims = dims[..keep].to_vec();
    dims.extend_from_slice(tail);
    Shape::from(dims)
}

/// Real `(.., H, W)` to scaled half spectrum `(.., H, W/2+1, 2)`.
#[derive(Clone, Copy, Debug)]
struct Rfft2 {
    scale: f32,
}

/// Adjoint of [`Rfft2`]: half spectrum gradient back to `(.., H, W)`.
#[derive(Clone, Copy, Debug)]
struct Rfft2Adjoint {
    width: usize,
    scale: f32,
}

/// Half spectrum `(.., H, W/2+1, 2)` to real `(.., H, W)`, c2r semantics.
#[derive(Clone, Copy, Debug)]
struct Irfft2 {
    width: usize,
    scale: f32,
}

/// Adjoint of [`Irfft2`]: real gradient to half spectrum gradient.
#[derive(Clone, Copy, Debug)]
struct Irfft2Adjoint {
    scale: f32,
}

/// Forward transform of each real plane, keeping the first `bins` columns.
fn forward_half(xs: &[f32], h: usize, w: usize, scale: f32) -> Vec<f32> {
    let bins = w / 2 + 1;
    let mut out = Vec::with_capacity(xs.len() / w * bins * 2);
    let mut buf = vec![Complex::default(); h * w];
    for plane in xs.chunks_exact(h * w) {
        for (b, &v) in buf.iter_mut().zip(plane) {
            *b = Complex::new(v, 0.0);
        }
        fft2_plane(&mut buf, h, w, false);
        for row in buf.chunks_exact(w) {
            for v in &row[..bins] {
                out.push(v.re * scale);
                out.push(v.im * scale);
            }
        }
    }
    out
}

/// Rows `h` and half-spectrum columns of a `(.., H, bins, 2)` layout.
fn spectrum_dims(shape: &Shape) -> Result<(usize, usize, usize)> {
    let dims = shape.dims();
    let rank = dims.len();
    if rank < 3 || dims[rank - 1] != 2 {
        bail!("expected a spectrum shaped (.., H, W/2+1, 2), got {shape:?}")
    }
    Ok((rank, dims[rank - 3], dims[rank - 2]))
}

impl CustomOp1 for Rfft2 {
    fn name(&self) -> &'static str {
        "rfft2"
    }

    #[instrument(level = "trace", skip_all)]
    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let xs = contiguous_f32(storage, layout)?;
        let dims = layout.shape().dims();
        let rank = dims.len();
        let (h, w) = (dims[rank - 2], dims[rank - 1]);
        let out = forward_half(xs, h, w, self.scale);
        Ok((CpuStorage::F32(out), with_plane(dims, rank - 1, &[w / 2 + 1, 2])))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let op = Rfft2Adjoint {
            width: arg.dim(candle_core::D::Minus1)?,
            scale: self.scale,
        };
        Ok(Some(grad_res.contiguous()?.apply_op1_no_bwd(&op)?))
    }
}

impl CustomOp1 for Rfft2Adjoint {
    fn name(&self) -> &'static str {
        "rfft2-adjoint"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let gs = contiguous_f32(storage, layout)?;
        let (rank, h, bins) = spectrum_dims(layout.shape())?;
        let w = self.width;
        let mut out = Vec::with_capacity(gs.len() / (bins * 2) * w);
        let mut buf = vec![Complex::default(); h * w];
        for plane in gs.chunks_exact(h * bins * 2) {
            buf.fill(Complex::default());
            for k in 0..h {
                for l in 0..bins {
                    let i = (k * bins + l) * 2;
                    buf[k * w + l] = Complex::new(plane[i], plane[i + 1]);
                }
            }
            fft2_plane(&mut buf, h, w, true);
            out.extend(buf.iter().map(|v| v.re * self.scale));
        }
        Ok((CpuStorage::F32(out), with_plane(layout.shape().dims(), rank - 2, &[w])))
    }
}

impl CustomOp1 for Irfft2 {
    fn name(&self) -> &'static str {
        "irfft2"
    }

    #[instrument(level = "trace", skip_all)]
    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let ys = contiguous_f32(storage, layout)?;
        let (rank, h, bins) = spectrum_dims(layout.shape())?;
        let w = self.width;
        if bins != w / 2 + 1 {
            bail!("irfft2: {bins} bins cannot reconstruct width {w}")
        }
        let mut out = Vec::with_capacity(ys.len() / (bins * 2) * w);
        let mut buf = vec![Complex::default(); h * w];
        for plane in ys.chunks_exact(h * bins * 2) {
            for k in 0..h {
                for l in 0..w {
                    buf[k * w + l] = if l < bins {
                        let i = (k * bins + l) * 2;
                        Complex::new(plane[i], plane[i + 1])
                    } else {
                        // mirrored bin: conj(Y[-k, W-l])
                        let i = (((h - k) % h) * bins + (w - l)) * 2;
                        Complex::new(plane[i], -plane[i + 1])
                    };
                }
            }
            fft2_plane(&mut buf, h, w, true);
            out.extend(buf.iter().map(|v| v.re * self.scale));
        }
        Ok((CpuStorage::F32(out), with_plane(layout.shape().dims(), rank - 3, &[h, w])))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let op = Irfft2Adjoint { scale: self.scale };
        Ok(Some(grad_res.contiguous()?.apply_op1_no_bwd(&op)?))
    }
}

impl CustomOp1 for Irfft2Adjoint {
    fn name(&self) -> &'static str {
        "irfft2-adjoint"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let gs = contiguous_f32(storage, layout)?;
        let dims = layout.shape().dims();
        let rank = dims.len();
        let (h, w) = (dims[rank - 2], dims[rank - 1]);
        let bins = w / 2 + 1;
        let mut out = forward_half(gs, h, w, self.scale);
        for (j, v) in out.iter_mut().enumerate() {
            *v *= bin_weight((j / 2) % bins, w);
        }
        Ok((CpuStorage::F32(out), with_plane(dims, rank - 1, &[bins, 2])))
    }
}

/// Runs `f` on an `F32` CPU copy of `xs` and moves the result back.
fn on_host(xs: &Tensor, f: impl FnOnce(&Tensor) -> Result<Tensor>) -> Result<Tensor> {
    let (device, dtype) = (xs.device().clone(), xs.dtype());
    let ys = f(&xs.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.contiguous()?)?;
    ys.to_device(&device)?.to_dtype(dtype)
}

fn check_plane(h: usize, w: usize) -> Result<()> {
    if h == 0 || w == 0 {
        return Err(Error::Msg(format!("fft over an empty {h}x{w} plane")));
    }
    Ok(())
}

/// `(.., H, W)` real input to `(.., H, W/2+1, 2)`, every element scaled by
/// `scale`. Differentiable.
pub(crate) fn rfft2(xs: &Tensor, scale: f64) -> Result<Tensor> {
    let (h, w) = (xs.dim(candle_core::D::Minus2)?, xs.dim(candle_core::D::Minus1)?);
    check_plane(h, w)?;
    on_host(xs, |xs| xs.apply_op1(Rfft2 { scale: scale as f32 }))
}

/// `(.., H, W/2+1, 2)` half spectrum to `(.., H, width)` real output scaled
/// by `scale`. Differentiable.
pub(crate) fn irfft2(spectrum: &Tensor, width: usize, scale: f64) -> Result<Tensor> {
    let (_, h, _) = spectrum_dims(spectrum.shape())?;
    check_plane(h, width)?;
    on_host(spectrum, |ys| {
        ys.apply_op1(Irfft2 {
            width,
            scale: scale as f32,
        })
    })
}
