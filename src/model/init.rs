//! Parameter constructors carrying the backbone's default initialization.
//!
//! When the [`VarBuilder`] is backed by a `VarMap`, the hints below decide the
//! initial values; when it is backed by a checkpoint they are ignored.
//!
//! | parameter            | init                                   |
//! |----------------------|----------------------------------------|
//! | conv weight          | Kaiming normal, fan-out, ReLU gain     |
//! | conv bias            | uniform `±1/√fan_in`                   |
//! | linear weight        | truncated normal, std 0.02             |
//! | linear bias          | 0                                      |
//! | norm weight / bias   | 1 / 0                                  |
//! | class token          | truncated normal, std 0.02             |

use candle_core::{Device, Shape, Tensor};
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, LayerNorm, Linear, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::{Error, Result};

pub const TRUNC_NORMAL_STD: f64 = 0.02;

/// Truncated normal with absolute bounds `[-2, 2]`.
///
/// At std 0.02 the bounds sit 100σ out, so plain normal sampling never
/// produces a value that truncation would reject.
pub fn trunc_normal(std: f64) -> Init {
    Init::Randn {
        mean: 0.0,
        stdev: std,
    }
}

pub const KAIMING_FAN_OUT: Init = Init::Kaiming {
    dist: NormalOrUniform::Normal,
    fan: FanInOut::FanOut,
    non_linearity: NonLinearity::ReLU,
};

/// Square-kernel Conv2d with Kaiming fan-out weights.
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv2dConfig,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (
            out_channels,
            in_channels / cfg.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
        KAIMING_FAN_OUT,
    )?;
    let bias = if bias {
        let fan_in = (in_channels / cfg.groups) * kernel_size * kernel_size;
        let bound = 1.0 / (fan_in as f64).sqrt();
        Some(vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?)
    } else {
        None
    };
    Ok(Conv2d::new(weight, bias, cfg))
}

/// Linear layer with truncated-normal weights and zero bias.
pub fn linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        trunc_normal(TRUNC_NORMAL_STD),
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

pub fn batch_norm(channels: usize, eps: f64, vb: VarBuilder) -> Result<BatchNorm> {
    Ok(candle_nn::batch_norm(channels, eps, vb)?)
}

pub fn layer_norm(dim: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    Ok(candle_nn::layer_norm(dim, eps, vb)?)
}

/// Overwrite a stored parameter in place with a constant.
///
/// Modules built from the same `VarMap` share storage with the variable, so
/// the new value is visible to them immediately.
pub fn fill(varmap: &VarMap, name: &str, value: f64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::WeightLoad("parameter store lock poisoned".to_string()))?;
    let var = data
        .get(name)
        .ok_or_else(|| Error::WeightLoad(format!("no parameter named '{name}'")))?;
    let filled = var.ones_like()?.affine(value, 0.0)?;
    var.set(&filled)?;
    Ok(())
}

/// Standard-normal f32 tensor drawn from a seeded `ChaCha8Rng`.
///
/// candle cannot seed its CPU generator, so reproducible inputs come from here.
pub fn seeded_normal(shape: impl Into<Shape>, seed: u64, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Module};

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn std_of(t: &Tensor) -> f32 {
        let t = t.flatten_all().unwrap();
        let mean = t.mean_all().unwrap();
        t.broadcast_sub(&mean)
            .unwrap()
            .sqr()
            .unwrap()
            .mean_all()
            .unwrap()
            .sqrt()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn conv_weights_use_fan_out_gain() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let conv = conv2d(64, 256, 3, Conv2dConfig::default(), false, vb).unwrap();
        // std = sqrt(2 / fan_out) = sqrt(2 / (256 * 9))
        let expected = (2.0_f32 / (256.0 * 9.0)).sqrt();
        let actual = std_of(conv.weight());
        assert!(
            (actual - expected).abs() / expected < 0.1,
            "std {actual} vs {expected}"
        );
        assert!(conv.bias().is_none());
    }

    #[test]
    fn linear_weights_are_small_and_bias_zero() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let fc = linear(128, 256, true, vb).unwrap();
        let actual = std_of(fc.weight());
        assert!((actual - 0.02).abs() < 0.003, "std {actual}");
        let bias_sum: f32 = fc.bias().unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(bias_sum, 0.0);
    }

    #[test]
    fn fill_updates_module_in_place() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let fc = linear(4, 4, true, vb.pp("fc")).unwrap();
        fill(&varmap, "fc.bias", 0.5).unwrap();
        let x = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        let y: Vec<f32> = fc.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![0.5; 4]);
    }

    #[test]
    fn fill_unknown_name_fails() {
        let varmap = VarMap::new();
        assert!(matches!(fill(&varmap, "nope", 0.0), Err(Error::WeightLoad(_))));
    }

    #[test]
    fn seeded_normal_is_reproducible() {
        let device = Device::Cpu;
        let a = seeded_normal((2, 3, 5), 7, &device).unwrap();
        let b = seeded_normal((2, 3, 5), 7, &device).unwrap();
        let c = seeded_normal((2, 3, 5), 8, &device).unwrap();
        let diff = |x: &Tensor, y: &Tensor| -> f32 {
            (x - y).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap()
        };
        assert_eq!(a.dims(), &[2, 3, 5]);
        assert_eq!(diff(&a, &b), 0.0);
        assert!(diff(&a, &c) > 0.0);
    }

    #[test]
    fn seeded_normal_has_unit_moments() {
        let t = seeded_normal(20_000, 3, &Device::Cpu).unwrap();
        let mean: f32 = t.mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 0.05, "mean {mean}");
        let std = std_of(&t);
        assert!((std - 1.0).abs() < 0.05, "std {std}");
    }
}
