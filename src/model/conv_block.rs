//! Bottleneck residual unit of the convolutional branch.
//!
//! ```text
//! x ─→ conv1 1×1 → bn1 → ReLU ─(+ x_t)→ conv2 3×3/s → bn2 → ReLU ─→ x2
//!   x2 → conv3 1×1 → bn3 → drop_path ─→ (+ residual) → ReLU ─→ out
//! residual = x, or residual_conv 1×1/s → residual_bn when `res_conv`
//! ```
//!
//! `x2` is the mid-block activation the fusion stage projects into the
//! token branch; `x_t` is the token-derived addend injected before `conv2`.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, VarMap};

use super::Phase;
use super::drop::DropPath;
use super::init;
use crate::Result;
use crate::config::EXPANSION;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub res_conv: bool,
    pub groups: usize,
    pub drop_path_rate: f64,
    pub eps: f64,
}

impl ConvBlockConfig {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            stride: 1,
            res_conv: false,
            groups: 1,
            drop_path_rate: 0.0,
            eps: 1e-6,
        }
    }
}

pub struct ConvBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    residual: Option<(Conv2d, BatchNorm)>,
    drop_path: DropPath,
    /// Full parameter name of `bn3.weight`.
    last_bn_weight: String,
}

impl ConvBlock {
    pub fn new(cfg: &ConvBlockConfig, vb: VarBuilder) -> Result<Self> {
        let med = cfg.out_channels / EXPANSION;
        let pointwise = Conv2dConfig::default();
        let spatial = Conv2dConfig {
            padding: 1,
            stride: cfg.stride,
            groups: cfg.groups,
            ..Default::default()
        };

        let conv1 = init::conv2d(cfg.in_channels, med, 1, pointwise, false, vb.pp("conv1"))?;
        let bn1 = init::batch_norm(med, cfg.eps, vb.pp("bn1"))?;
        let conv2 = init::conv2d(med, med, 3, spatial, false, vb.pp("conv2"))?;
        let bn2 = init::batch_norm(med, cfg.eps, vb.pp("bn2"))?;
        let conv3 = init::conv2d(med, cfg.out_channels, 1, pointwise, false, vb.pp("conv3"))?;
        let bn3 = init::batch_norm(cfg.out_channels, cfg.eps, vb.pp("bn3"))?;

        let residual = if cfg.res_conv {
            let shortcut = Conv2dConfig {
                stride: cfg.stride,
                ..Default::default()
            };
            Some((
                init::conv2d(
                    cfg.in_channels,
                    cfg.out_channels,
                    1,
                    shortcut,
                    false,
                    vb.pp("residual_conv"),
                )?,
                init::batch_norm(cfg.out_channels, cfg.eps, vb.pp("residual_bn"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            residual,
            drop_path: DropPath::new(cfg.drop_path_rate),
            last_bn_weight: format!("{}.weight", vb.pp("bn3").prefix()),
        })
    }

    /// Block output only.
    pub fn forward(&self, x: &Tensor, x_t: Option<&Tensor>, phase: Phase) -> Result<Tensor> {
        self.forward_with_intermediate(x, x_t, phase)
            .map(|(out, _)| out)
    }

    /// Block output together with the post-`conv2` activation.
    pub fn forward_with_intermediate(
        &self,
        x: &Tensor,
        x_t: Option<&Tensor>,
        phase: Phase,
    ) -> Result<(Tensor, Tensor)> {
        let bn = phase.batch_stats;

        let h = self.conv1.forward(x)?;
        let h = self.bn1.forward_t(&h, bn)?.relu()?;

        let h = match x_t {
            Some(x_t) => self.conv2.forward(&(h + x_t)?)?,
            None => self.conv2.forward(&h)?,
        };
        let x2 = self.bn2.forward_t(&h, bn)?.relu()?;

        let h = self.conv3.forward(&x2)?;
        let h = self.bn3.forward_t(&h, bn)?;
        let h = self.drop_path.forward_t(&h, phase.train)?;

        let residual = match &self.residual {
            Some((conv, norm)) => norm.forward_t(&conv.forward(x)?, bn)?,
            None => x.clone(),
        };

        let out = (h + residual)?.relu()?;
        Ok((out, x2))
    }

    /// Zero the scale of `bn3` so the residual branch starts as identity.
    pub fn zero_init_last_bn(&self, varmap: &VarMap) -> Result<()> {
        init::fill(varmap, &self.last_bn_weight, 0.0)
    }

    pub fn last_bn_weight(&self) -> Option<&Tensor> {
        self.bn3.weight_and_bias().map(|(weight, _)| weight)
    }

    pub fn drop_path_rate(&self) -> f64 {
        self.drop_path.drop_prob()
    }

    pub fn has_shortcut_projection(&self) -> bool {
        self.residual.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn identity_shape_without_projection() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let block = ConvBlock::new(&ConvBlockConfig::new(32, 32), vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 32, 8, 8), &device).unwrap();
        let (out, x2) = block
            .forward_with_intermediate(&x, None, Phase::EVAL)
            .unwrap();
        assert_eq!(out.dims(), &[2, 32, 8, 8]);
        assert_eq!(x2.dims(), &[2, 8, 8, 8]);
        assert!(!block.has_shortcut_projection());
    }

    #[test]
    fn strided_projection_halves_resolution() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let cfg = ConvBlockConfig {
            stride: 2,
            res_conv: true,
            ..ConvBlockConfig::new(32, 64)
        };
        let block = ConvBlock::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 32, 8, 8), &device).unwrap();
        let (out, x2) = block
            .forward_with_intermediate(&x, None, Phase::EVAL)
            .unwrap();
        assert_eq!(out.dims(), &[1, 64, 4, 4]);
        assert_eq!(x2.dims(), &[1, 16, 4, 4]);
    }

    #[test]
    fn side_input_changes_output() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let block = ConvBlock::new(&ConvBlockConfig::new(16, 16), vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 16, 4, 4), &device).unwrap();
        let x_t = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
        let plain = block.forward(&x, None, Phase::EVAL).unwrap();
        let fused = block.forward(&x, Some(&x_t), Phase::EVAL).unwrap();
        let diff: f32 = (&plain - &fused)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn zero_init_last_bn_zeroes_scale() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let block = ConvBlock::new(&ConvBlockConfig::new(16, 16), vb.pp("block")).unwrap();
        block.zero_init_last_bn(&varmap).unwrap();
        let weight: Vec<f32> = block.last_bn_weight().unwrap().to_vec1().unwrap();
        assert_eq!(weight.len(), 16);
        assert!(weight.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn zeroed_branch_reduces_to_relu_of_input() {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let block = ConvBlock::new(&ConvBlockConfig::new(8, 8), vb).unwrap();
        block.zero_init_last_bn(&varmap).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 8, 4, 4), &device).unwrap();
        let out = block.forward(&x, None, Phase::EVAL).unwrap();
        let diff: f32 = (&out - x.relu().unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6, "diff = {diff}");
    }
}
