//! Seeded parameter initialisation for models built from a [`VarMap`].
use candle_core::{Error, Result, Tensor};
use candle_nn::VarMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParamKind {
    /// Convolution kernels.
    Kernel,
    /// Norm scales and attention temperatures.
    Scale,
    /// Biases of convolutions and norms.
    Shift,
}

impl ParamKind {
    fn of(name: &str, rank: usize) -> Self {
        if name.ends_with("bias") {
            ParamKind::Shift
        } else if rank == 4 {
            ParamKind::Kernel
        } else {
            ParamKind::Scale
        }
    }
}

/// Overwrites every variable of a [`VarMap`]: kernels from `N(0, std)`,
/// scales with one, shifts with zero.
///
/// Variables are visited in name order from a single seeded generator, so two
/// maps holding the same model receive identical values for the same seed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightInit {
    seed: u64,
    std: f64,
}

impl Default for WeightInit {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WeightInit {
    pub fn new(seed: u64) -> Self {
        Self { seed, std: 0.02 }
    }

    pub fn with_std(self, std: f64) -> Self {
        Self { std, ..self }
    }

    /// Returns the number of variables written.
    pub fn apply(&self, varmap: &VarMap) -> Result<usize> {
        let normal = Normal::new(0.0, self.std).map_err(|e| Error::Msg(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("var map lock poisoned".into()))?;
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();

        for name in names.iter() {
            let var = &vars[name.as_str()];
            let n = var.elem_count();
            let values: Vec<f32> = match ParamKind::of(name, var.rank()) {
                ParamKind::Kernel => (0..n).map(|_| normal.sample(&mut rng) as f32).collect(),
                ParamKind::Scale => vec![1.0; n],
                ParamKind::Shift => vec![0.0; n],
            };
            let values = Tensor::from_vec(values, var.shape().clone(), var.device())?.to_dtype(var.dtype())?;
            var.set(&values)?;
        }
        tracing::debug!(seed = self.seed, std = self.std, vars = names.len(), "initialised weights");
        Ok(names.len())
    }
}
