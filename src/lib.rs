use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::{DynamicImage, GrayImage, RgbImage};
pub use candle_core;
pub use candle_nn;

use std::error::Error;
use std::path::Path;

use crate::candle::{Config, generator::Generator};

pub mod candle;

/// RGB image to a `(1, 3, H, W)` `f32` tensor in `[0, 1]`.
pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> candle_core::Result<Tensor> {
    let img = image.to_rgb8();
    let (width, height) = img.dimensions();
    let data = img.into_raw();
    let xs = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?;
    xs.unsqueeze(0)?.to_dtype(DType::F32)? * (1. / 255.)
}

/// Quantises a `[0, 1]` tensor of rank 3 or 4 (batch of one) to 8 bits.
fn to_pixels(xs: &Tensor, channels: usize) -> candle_core::Result<(usize, usize, Vec<u8>)> {
    let xs = if xs.rank() == 4 { xs.squeeze(0)? } else { xs.clone() };
    let (c, h, w) = xs.dims3()?;
    if c != channels {
        return Err(candle_core::Error::Msg(format!(
            "expected {channels} channels, got {:?}",
            xs.shape()
        )));
    }
    let data = (xs.clamp(0f32, 1f32)? * 255.)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    Ok((h, w, data))
}

/// `(1, 3, H, W)` or `(3, H, W)` tensor in `[0, 1]` to an RGB image.
pub fn tensor_to_image(xs: &Tensor) -> candle_core::Result<DynamicImage> {
    let (h, w, data) = to_pixels(xs, 3)?;
    RgbImage::from_raw(w as u32, h as u32, data)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| candle_core::Error::Msg(format!("cannot build a {w}x{h} rgb image")))
}

/// Single-channel mask to a grayscale image.
pub fn mask_to_image(mask: &Tensor) -> candle_core::Result<GrayImage> {
    let (h, w, data) = to_pixels(mask, 1)?;
    GrayImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| candle_core::Error::Msg(format!("cannot build a {w}x{h} mask image")))
}

/// Derained image together with the last spatial attention mask.
#[derive(Debug, Clone)]
pub struct Restoration {
    pub image: DynamicImage,
    pub mask: GrayImage,
}

/// Deraining engine: image in, restored image and rain mask out.
#[derive(Debug)]
pub struct Derainer {
    generator: Generator,
    device: Device,
}

impl Derainer {
    pub fn new(generator: Generator, device: Device) -> Self {
        Self { generator, device }
    }

    /// Loads generator weights (`gen.gen.*`) from safetensors files.
    pub fn from_safetensors<P: AsRef<Path>>(
        paths: &[P],
        cfg: &Config,
        gpu_ids: &[usize],
    ) -> Result<Self, Box<dyn Error>> {
        let device = Generator::devices(gpu_ids)?.remove(0);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, DType::F32, &device) }?;
        let generator = Generator::load(vb, cfg, gpu_ids)?;
        Ok(Self::new(generator, device))
    }

    pub fn run(&self, image: &DynamicImage) -> Result<Restoration, Box<dyn Error>> {
        let xs = image_to_tensor(image, &self.device)?;
        let (_, _, h, w) = xs.dims4()?;
        // the transformer path halves the resolution once
        let xs = xs.pad_with_same(2, 0, h % 2)?.pad_with_same(3, 0, w % 2)?;
        let (mask, restored) = self.generator.forward(&xs)?;
        let restored = restored.narrow(2, 0, h)?.narrow(3, 0, w)?;
        let mask = mask.narrow(2, 0, h)?.narrow(3, 0, w)?;
        tracing::debug!(height = h, width = w, "derained image");
        Ok(Restoration {
            image: tensor_to_image(&restored)?,
            mask: mask_to_image(&mask)?,
        })
    }

    pub fn run_bytes(&self, buffer: &[u8]) -> Result<Restoration, Box<dyn Error>> {
        let image = image::load_from_memory(buffer)?;
        self.run(&image)
    }
}
