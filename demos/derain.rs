use anyhow::{Context, Result};
use spaformer::candle::Config;
use spaformer::candle::generator::Generator;
use spaformer::Derainer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

// derain <rainy.png> [weights.safetensors...]
// Without weights the generator is randomly initialised, which only exercises
// the pipeline.
fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,spaformer=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(filter)
        .init();

    let mut args = std::env::args().skip(1);
    let input = args.next().context("usage: derain <image> [weights.safetensors...]")?;
    let weights: Vec<String> = args.collect();

    let cfg = Config::default();
    let gpu_ids = if candle_core::utils::cuda_is_available() { vec![0] } else { vec![] };
    let derainer = if weights.is_empty() {
        tracing::warn!("no weights given, using seeded random initialisation");
        let device = Generator::devices(&gpu_ids)?.remove(0);
        let (generator, _vars) = Generator::new(&gpu_ids, &cfg, 0)?;
        Derainer::new(generator, device)
    } else {
        Derainer::from_safetensors(&weights, &cfg, &gpu_ids)
            .map_err(|e| anyhow::anyhow!("loading {weights:?}: {e}"))?
    };

    let image = image::open(&input).with_context(|| format!("reading {input}"))?;
    let start = std::time::Instant::now();
    let restored = derainer.run(&image).map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(elapsed = ?start.elapsed(), "forward pass done");

    restored.image.save("derained.png")?;
    restored.mask.save("mask.png")?;
    println!("wrote derained.png and mask.png");
    Ok(())
}
