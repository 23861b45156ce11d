mod common;

use std::error::Error;

use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use spaformer::candle::generator::Generator;
use spaformer::candle::refine::{RefineSchedule, StepGate};
use spaformer::candle::{Config, SpaNet};

use common::{all_finite, max_abs_diff, ramp};

#[test]
fn test_spanet_default_config_on_zeros() -> Result<(), Box<dyn Error>> {
    let (model, _vars) = SpaNet::init(&Config::default(), 0, &Device::Cpu)?;
    let xs = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu)?;
    let (mask, image) = model.forward(&xs)?;
    assert_eq!(image.dims(), &[1, 3, 64, 64]);
    assert_eq!(mask.dims(), &[1, 1, 64, 64]);
    assert!(all_finite(&image)?);
    assert!(all_finite(&mask)?);
    Ok(())
}

#[test]
fn test_spanet_tiny_batch() -> Result<(), Box<dyn Error>> {
    let cfg = Config::tiny();
    let (model, _vars) = SpaNet::init(&cfg, 1, &Device::Cpu)?;
    let (mask, image) = model.forward(&ramp(&[2, 3, 12, 10], 4)?)?;
    assert_eq!(image.dims(), &[2, 3, 12, 10]);
    assert_eq!(mask.dims(), &[2, 1, 12, 10]);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(all_finite(&image)?);
    Ok(())
}

#[test]
fn test_spanet_rejects_odd_size() -> Result<(), Box<dyn Error>> {
    let (model, _vars) = SpaNet::init(&Config::tiny(), 0, &Device::Cpu)?;
    assert!(model.forward(&ramp(&[1, 3, 9, 8], 0)?).is_err());
    assert!(model.forward(&ramp(&[1, 3, 8, 7], 0)?).is_err());
    Ok(())
}

#[test]
fn test_spanet_parameter_names() -> Result<(), Box<dyn Error>> {
    let (_model, vars) = SpaNet::init(&Config::tiny(), 0, &Device::Cpu)?;
    let data = vars.data().lock().unwrap();
    for key in [
        "conv_in.0.weight",
        "conv_in1.0.weight",
        "conv_in2.0.weight",
        "SAM1.irnn1.left_weight.weight",
        "SAM1.irnn2.down_weight.bias",
        "SAM1.attention_layer.conv3.weight",
        "SAM1.conv_out.weight",
        "res_block1.main.conv1.weight",
        "res_block17.main.conv2.weight",
        "fft_block17.main_fft.conv1.weight",
        "conv_out.0.weight",
    ] {
        assert!(data.contains_key(key), "missing {key}");
    }
    assert!(!data.contains_key("res_block18.main.conv1.weight"));
    assert!(!data.contains_key("SAM1.conv_in.weight"));
    Ok(())
}

#[test]
fn test_default_schedule() {
    let schedule = RefineSchedule::default();
    assert_eq!(schedule.steps(), 17);
    assert_eq!(schedule.sam_calls(), 4);
    for step in 0..schedule.steps() {
        let expected = match step {
            3 | 6 | 9 | 12 => StepGate::Refresh,
            4..=14 => StepGate::Masked,
            _ => StepGate::Plain,
        };
        assert_eq!(schedule.gate(step), expected, "step {step}");
    }
    let refreshes = (0..schedule.steps())
        .filter(|&s| schedule.gate(s) == StepGate::Refresh)
        .count();
    assert_eq!(refreshes, schedule.sam_calls());
}

#[test]
fn test_config_validation() {
    assert!(Config::default().validate().is_ok());
    assert!(Config::tiny().validate().is_ok());

    let odd_dim = Config { dim: 7, ..Config::tiny() };
    assert!(odd_dim.validate().is_err());

    let bad_heads = Config { heads: [3, 1, 1, 2], ..Config::tiny() };
    assert!(bad_heads.validate().is_err());

    let no_masks = Config {
        schedule: RefineSchedule { groups: 0, ..RefineSchedule::default() },
        ..Config::tiny()
    };
    assert!(no_masks.validate().is_err());

    let varmap = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(SpaNet::load(vb, &odd_dim).is_err());
}

#[test]
fn test_seeded_init_is_deterministic() -> Result<(), Box<dyn Error>> {
    let cfg = Config::tiny();
    let xs = ramp(&[1, 3, 8, 8], 2)?;
    let (a, _) = SpaNet::init(&cfg, 42, &Device::Cpu)?;
    let (b, _) = SpaNet::init(&cfg, 42, &Device::Cpu)?;
    let (c, _) = SpaNet::init(&cfg, 43, &Device::Cpu)?;
    let (_, ya) = a.forward(&xs)?;
    let (_, yb) = b.forward(&xs)?;
    let (_, yc) = c.forward(&xs)?;
    assert_abs_diff_eq!(max_abs_diff(&ya, &yb)?, 0.0, epsilon = 1e-6);
    assert!(max_abs_diff(&ya, &yc)? > 0.0);
    Ok(())
}

#[test]
fn test_generator_matches_bare_network() -> Result<(), Box<dyn Error>> {
    let cfg = Config::tiny();
    let xs = ramp(&[1, 3, 8, 6], 9)?;
    let (net, _) = SpaNet::init(&cfg, 5, &Device::Cpu)?;
    let (generator, vars) = Generator::new(&[], &cfg, 5)?;
    assert_eq!(generator.replicas(), 1);
    assert!(vars.data().lock().unwrap().keys().all(|k| k.starts_with("gen.gen.")));

    let (mask, image) = net.forward(&xs)?;
    let (gen_mask, gen_image) = generator.forward(&xs)?;
    assert_abs_diff_eq!(max_abs_diff(&mask, &gen_mask)?, 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(max_abs_diff(&image, &gen_image)?, 0.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_generator_cpu_and_device_zero_agree() -> Result<(), Box<dyn Error>> {
    let cfg = Config::tiny();
    let xs = ramp(&[1, 3, 8, 8], 6)?;
    let (cpu, _) = Generator::new(&[], &cfg, 11)?;
    let (dev0, _) = Generator::new(&[0], &cfg, 11)?;
    let (_, a) = cpu.forward(&xs)?;
    let (_, b) = dev0.forward(&xs)?;
    let b = b.to_device(&Device::Cpu)?;
    assert!(max_abs_diff(&a, &b)? < 1e-4);
    Ok(())
}

#[test]
fn test_generator_splits_batch_across_replicas() -> Result<(), Box<dyn Error>> {
    let cfg = Config::tiny();
    let xs = ramp(&[3, 3, 8, 8], 12)?;
    let (single, _) = Generator::new(&[], &cfg, 3)?;
    let (split, _) = Generator::new(&[0, 1], &cfg, 3)?;
    assert_eq!(split.replicas(), 2);

    let (mask, image) = single.forward(&xs)?;
    let (split_mask, split_image) = split.forward(&xs)?;
    assert_eq!(split_image.dims(), &[3, 3, 8, 8]);
    assert_eq!(split_mask.dims(), &[3, 1, 8, 8]);
    let split_image = split_image.to_device(&Device::Cpu)?;
    let split_mask = split_mask.to_device(&Device::Cpu)?;
    assert!(max_abs_diff(&image, &split_image)? < 1e-4);
    assert!(max_abs_diff(&mask, &split_mask)? < 1e-4);
    Ok(())
}
