mod common;

use std::error::Error;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use candle_core::{DType, Device, Module, Tensor, Var};
use rustfft::{FftPlanner, num_complex::Complex};
use spaformer::candle::block::FftResBlock;
use spaformer::candle::op::{FftNorm, SpectralOps, Spectrum};

use common::{init_with, load_with, max_abs_diff, ramp};

/// Full 2D complex FFT of a row-major `h x w` real image.
fn reference_fft2(data: &[f32], h: usize, w: usize) -> Vec<Complex<f64>> {
    let mut planner = FftPlanner::<f64>::new();
    let mut buf: Vec<Complex<f64>> = data.iter().map(|&v| Complex::new(v as f64, 0.0)).collect();
    let row_fft = planner.plan_fft_forward(w);
    for row in buf.chunks_mut(w) {
        row_fft.process(row);
    }
    let col_fft = planner.plan_fft_forward(h);
    for c in 0..w {
        let mut col: Vec<Complex<f64>> = (0..h).map(|r| buf[r * w + c]).collect();
        col_fft.process(&mut col);
        for (r, v) in col.into_iter().enumerate() {
            buf[r * w + c] = v;
        }
    }
    buf
}

#[test]
fn test_rfft2_matches_rustfft() -> Result<(), Box<dyn Error>> {
    let (h, w) = (4, 6);
    let xs = ramp(&[1, 1, h, w], 7)?;
    let spectrum = xs.rfft2(FftNorm::Backward)?;
    assert_eq!(spectrum.re.dims(), &[1, 1, h, w / 2 + 1]);

    let data = xs.flatten_all()?.to_vec1::<f32>()?;
    let expected = reference_fft2(&data, h, w);
    let re = spectrum.re.flatten_all()?.to_vec1::<f32>()?;
    let im = spectrum.im.flatten_all()?.to_vec1::<f32>()?;
    let bins = w / 2 + 1;
    for r in 0..h {
        for k in 0..bins {
            let want = expected[r * w + k];
            assert_abs_diff_eq!(re[r * bins + k] as f64, want.re, epsilon = 1e-4);
            assert_abs_diff_eq!(im[r * bins + k] as f64, want.im, epsilon = 1e-4);
        }
    }
    Ok(())
}

#[test]
fn test_round_trip_every_norm() -> Result<(), Box<dyn Error>> {
    for (h, w) in [(4, 6), (5, 7), (1, 3), (8, 1)] {
        let xs = ramp(&[2, 3, h, w], (h * 31 + w) as u64)?;
        for norm in [FftNorm::Backward, FftNorm::Forward, FftNorm::Ortho] {
            let back = xs.rfft2(norm)?.irfft2((h, w), norm)?;
            assert_eq!(back.dims(), xs.dims());
            let err = max_abs_diff(&back, &xs)?;
            assert!(err < 1e-4, "{norm:?} {h}x{w}: max error {err}");
        }
    }
    Ok(())
}

#[test]
fn test_norm_scaling() -> Result<(), Box<dyn Error>> {
    let xs = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu)?;
    let dc = |norm| -> candle_core::Result<f32> {
        xs.rfft2(norm)?.re.flatten_all()?.to_vec1::<f32>().map(|v| v[0])
    };
    assert_abs_diff_eq!(dc(FftNorm::Backward)?, 16.0, epsilon = 1e-4);
    assert_abs_diff_eq!(dc(FftNorm::Forward)?, 1.0, epsilon = 1e-5);
    assert_abs_diff_eq!(dc(FftNorm::Ortho)?, 4.0, epsilon = 1e-4);
    Ok(())
}

#[test]
fn test_norm_from_str() {
    assert_eq!("backward".parse::<FftNorm>().unwrap(), FftNorm::Backward);
    assert_eq!("ortho".parse::<FftNorm>().unwrap(), FftNorm::Ortho);
    assert_eq!("forward".parse::<FftNorm>().unwrap(), FftNorm::Forward);
    assert!("none".parse::<FftNorm>().is_err());
}

#[test]
fn test_fft_block_preserves_shape() -> Result<(), Box<dyn Error>> {
    let (block, _vars) = init_with(3, |vb| FftResBlock::load(vb, 4, 4, FftNorm::Backward))?;
    for (h, w) in [(1, 1), (3, 5), (6, 6), (7, 10)] {
        let xs = ramp(&[2, 4, h, w], 11)?;
        let ys = block.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 4, h, w]);
    }
    Ok(())
}

#[test]
fn test_fft_block_identity_kernels_pass_impulse() -> Result<(), Box<dyn Error>> {
    // a unit impulse has a flat, purely real spectrum, so the ReLU between
    // the identity kernels leaves it untouched
    let c = 2;
    let eye = Tensor::eye(2 * c, DType::F32, &Device::Cpu)?.reshape((2 * c, 2 * c, 1, 1))?;
    for norm in [FftNorm::Backward, FftNorm::Ortho] {
        let block = load_with(
            vec![
                ("main_fft.conv1.weight", eye.clone()),
                ("main_fft.conv2.weight", eye.clone()),
            ],
            |vb| FftResBlock::load(vb, c, c, norm),
        )?;
        let mut data = vec![0f32; c * 5 * 6];
        data[0] = 1.0;
        data[5 * 6] = 2.0;
        let xs = Tensor::from_vec(data, (1, c, 5, 6), &Device::Cpu)?;
        let ys = block.forward(&xs)?;
        let err = max_abs_diff(&ys, &xs)?;
        assert!(err < 1e-5, "{norm:?}: max error {err}");
    }
    Ok(())
}

/// Quartic loss through both transforms, mixing real and imaginary parts.
fn spectral_loss(xs: &Tensor, (h, w): (usize, usize)) -> candle_core::Result<Tensor> {
    let spectrum = xs.rfft2(FftNorm::Ortho)?;
    let mixed = Spectrum {
        re: (spectrum.re.sqr()? + &spectrum.im)?,
        im: (&spectrum.im * 0.5)?,
    };
    mixed.irfft2((h, w), FftNorm::Ortho)?.sqr()?.sum_all()
}

#[test]
fn test_gradients_match_finite_differences() -> Result<(), Box<dyn Error>> {
    let eps = 1e-2f32;
    for (h, w) in [(3, 4), (2, 5)] {
        let xs = ramp(&[1, 1, h, w], (h * w) as u64)?;
        let var = Var::from_tensor(&xs)?;
        let grads = spectral_loss(var.as_tensor(), (h, w))?.backward()?;
        let analytic = grads
            .get(var.as_tensor())
            .ok_or("no gradient for the input")?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let data = xs.flatten_all()?.to_vec1::<f32>()?;
        for i in 0..data.len() {
            let shifted = |delta: f32| -> candle_core::Result<f32> {
                let mut d = data.clone();
                d[i] += delta;
                let t = Tensor::from_vec(d, (1, 1, h, w), &Device::Cpu)?;
                spectral_loss(&t, (h, w))?.to_scalar::<f32>()
            };
            let numerical = (shifted(eps)? - shifted(-eps)?) / (2.0 * eps);
            assert_relative_eq!(analytic[i], numerical, epsilon = 5e-3, max_relative = 2e-2);
        }
    }
    Ok(())
}

#[test]
fn test_large_plane_round_trip() -> Result<(), Box<dyn Error>> {
    let xs = ramp(&[1, 2, 96, 130], 5)?;
    let back = xs.rfft2(FftNorm::Backward)?.irfft2((96, 130), FftNorm::Backward)?;
    assert!(max_abs_diff(&back, &xs)? < 1e-4);
    Ok(())
}

#[test]
fn test_irfft2_rejects_wrong_height() -> Result<(), Box<dyn Error>> {
    let spectrum = ramp(&[1, 1, 4, 6], 3)?.rfft2(FftNorm::Backward)?;
    assert!(spectrum.irfft2((5, 6), FftNorm::Backward).is_err());
    Ok(())
}
