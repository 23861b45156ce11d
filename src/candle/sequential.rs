//! Sequential Layer
//!
//! Chains layers and closures the way `nn.Sequential` does, including its
//! numbered parameter naming (`<prefix>.0`, `<prefix>.1`, ...).
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;
use std::fmt;

type Layer = Box<dyn Module + Send + Sync>;

pub struct Sequential {
    layers: Vec<Layer>,
}

impl fmt::Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequential")
            .field("layers", &self.layers.len())
            .finish()
    }
}

/// Creates a new empty sequential layer.
pub fn seq() -> Sequential {
    Sequential { layers: vec![] }
}

impl Sequential {
    /// Loads `n` layers of the same kind from the numbered children of `vb`.
    pub fn repeat<'a, M, F>(vb: VarBuilder<'a>, n: usize, mut load: F) -> Result<Self>
    where
        M: Module + Send + Sync + 'static,
        F: FnMut(VarBuilder<'a>) -> Result<M>,
    {
        let mut layers: Vec<Layer> = Vec::with_capacity(n);
        for i in 0..n {
            layers.push(Box::new(load(vb.pp(i.to_string()))?));
        }
        Ok(Self { layers })
    }

    /// The number of sub-layers embedded in this layer.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns true if this layer does not have any sub-layer.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Appends a layer after all the current layers.
    #[allow(clippy::should_implement_trait)]
    pub fn add<M: Module + Send + Sync + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Appends a closure after all the current layers.
    pub fn add_fn<F>(self, f: F) -> Self
    where
        F: 'static + Fn(&Tensor) -> Result<Tensor> + Send + Sync,
    {
        self.add(FuncImpl { f: Box::new(f) })
    }
}

impl Module for Sequential {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?
        }
        Ok(xs)
    }
}

struct FuncImpl {
    f: Box<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>,
}

impl Module for FuncImpl {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        (self.f)(xs)
    }
}
