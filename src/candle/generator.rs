use std::collections::HashMap;

use super::init::WeightInit;
use super::{Config, SpaNet};
use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rayon::prelude::*;

/// [`SpaNet`] behind the `gen.gen.` parameter prefix, optionally replicated
/// over several devices.
///
/// With device ids the batch is split along dim 0 into at most one chunk per
/// replica, the chunks run concurrently and the outputs are gathered on the
/// first device. Chunks are dispatched on the rayon pool.
#[derive(Debug)]
pub struct Generator {
    replicas: Vec<(Device, SpaNet)>,
    span: tracing::Span,
}

impl Generator {
    /// CPU when `gpu_ids` is empty, otherwise one CUDA device per id (falling
    /// back to the CPU when CUDA is unavailable).
    pub fn devices(gpu_ids: &[usize]) -> Result<Vec<Device>> {
        if gpu_ids.is_empty() {
            return Ok(vec![Device::Cpu]);
        }
        gpu_ids.iter().map(|&id| Device::cuda_if_available(id)).collect()
    }

    /// Loads one replica per device from `vb`, e.g. a safetensors checkpoint.
    pub fn load(vb: VarBuilder, cfg: &Config, gpu_ids: &[usize]) -> Result<Self> {
        let vb = vb.pp("gen").pp("gen");
        let mut replicas = Vec::new();
        for device in Self::devices(gpu_ids)? {
            tracing::info!(?device, "placing SPANet replica");
            let net = SpaNet::load(vb.clone().set_device(device.clone()), cfg)?;
            replicas.push((device, net));
        }
        Ok(Self {
            replicas,
            span: tracing::span!(tracing::Level::TRACE, "generator"),
        })
    }

    /// Builds fresh parameters on the first device, applies [`WeightInit`]
    /// once and copies the result to the other replicas.
    pub fn new(gpu_ids: &[usize], cfg: &Config, seed: u64) -> Result<(Self, VarMap)> {
        let devices = Self::devices(gpu_ids)?;
        let varmap = VarMap::new();
        let primary = SpaNet::load(
            VarBuilder::from_varmap(&varmap, DType::F32, &devices[0]).pp("gen").pp("gen"),
            cfg,
        )?;
        WeightInit::new(seed).apply(&varmap)?;

        let mut replicas = Vec::with_capacity(devices.len());
        replicas.push((devices[0].clone(), primary));
        if devices.len() > 1 {
            let tensors: HashMap<String, Tensor> = varmap
                .data()
                .lock()
                .map_err(|_| Error::Msg("var map lock poisoned".into()))?
                .iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect();
            for device in &devices[1..] {
                tracing::info!(?device, "placing SPANet replica");
                let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
                replicas.push((device.clone(), SpaNet::load(vb.pp("gen").pp("gen"), cfg)?));
            }
        }
        Ok((
            Self {
                replicas,
                span: tracing::span!(tracing::Level::TRACE, "generator"),
            },
            varmap,
        ))
    }

    pub fn replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let batch = xs.dim(0)?;
        let (primary, net) = &self.replicas[0];
        if self.replicas.len() == 1 || batch <= 1 {
            return net.forward(&xs.to_device(primary)?);
        }

        let chunks = xs.chunk(self.replicas.len().min(batch), 0)?;
        let outputs = chunks
            .par_iter()
            .zip(self.replicas.par_iter())
            .map(|(chunk, (device, net))| net.forward(&chunk.to_device(device)?))
            .collect::<Result<Vec<_>>>()?;

        let mut masks = Vec::with_capacity(outputs.len());
        let mut images = Vec::with_capacity(outputs.len());
        for (mask, image) in outputs {
            masks.push(mask.to_device(primary)?);
            images.push(image.to_device(primary)?);
        }
        Ok((Tensor::cat(&masks, 0)?, Tensor::cat(&images, 0)?))
    }
}
