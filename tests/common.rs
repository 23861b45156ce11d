#![allow(dead_code)]

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};
use spaformer::candle::init::WeightInit;

/// Builds a module from a fresh var map and initialises it with `seed`.
pub fn init_with<M>(seed: u64, load: impl FnOnce(VarBuilder) -> Result<M>) -> Result<(M, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let module = load(vb)?;
    WeightInit::new(seed).apply(&varmap)?;
    Ok((module, varmap))
}

/// Builds a module from explicit parameter values.
pub fn load_with<M>(
    tensors: Vec<(&str, Tensor)>,
    load: impl FnOnce(VarBuilder) -> Result<M>,
) -> Result<M> {
    let tensors: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(name, t)| (name.to_string(), t))
        .collect();
    load(VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu))
}

/// Builds a second module over a copy of the values held by `varmap`.
pub fn load_from_varmap<M>(varmap: &VarMap, load: impl FnOnce(VarBuilder) -> Result<M>) -> Result<M> {
    let tensors: HashMap<String, Tensor> = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("var map lock poisoned".into()))?
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect::<Result<_>>()?;
    load(VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu))
}

/// Seeded uniform values in `[-1, 1)`.
pub fn ramp(shape: &[usize], seed: u64) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(seed);
    let uniform = Uniform::new(-1f32, 1f32);
    let data: Vec<f32> = (0..n).map(|_| uniform.sample(&mut rng)).collect();
    Tensor::from_vec(data, shape, &Device::Cpu)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

pub fn all_finite(xs: &Tensor) -> Result<bool> {
    Ok(xs
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite()))
}
