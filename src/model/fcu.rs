//! Feature coupling units between the two branches.
//!
//! - [`FcuDown`]: conv feature map `[B, C, H, W]` → tokens `[B, L, E]`
//! - [`FcuUp`]: tokens `[B, L, E]` → conv feature map `[B, C, H·s, W·s]`
//!
//! With the class token enabled, `L = tokens + 1` and index 0 is the class
//! token. FcuDown copies it through from the incoming sequence; FcuUp drops it.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, LayerNorm, VarBuilder};

use super::Phase;
use super::init;
use crate::{Error, Result};

pub struct FcuDown {
    conv_project: Conv2d,
    ln: LayerNorm,
    dw_stride: usize,
    cls_token: bool,
}

impl FcuDown {
    pub fn new(
        in_channels: usize,
        embed_dims: usize,
        dw_stride: usize,
        cls_token: bool,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_project = init::conv2d(
            in_channels,
            embed_dims,
            1,
            Conv2dConfig::default(),
            true,
            vb.pp("conv_project"),
        )?;
        let ln = init::layer_norm(embed_dims, eps, vb.pp("ln"))?;
        Ok(Self {
            conv_project,
            ln,
            dw_stride,
            cls_token,
        })
    }

    /// Project `x` into token space, carrying over the class token of `x_t`.
    ///
    /// The result has the same sequence length as `x_t`.
    pub fn forward(&self, x: &Tensor, x_t: &Tensor) -> Result<Tensor> {
        let x = self.conv_project.forward(x)?;
        let x = if self.dw_stride > 1 {
            x.avg_pool2d(self.dw_stride)?
        } else {
            x
        };
        // [B, E, h, w] → [B, h·w, E]
        let x = x.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let x = self.ln.forward(&x)?.gelu_erf()?;

        let expected = x.dim(1)? + usize::from(self.cls_token);
        let incoming = x_t.dim(1)?;
        if incoming != expected {
            return Err(Error::Shape(format!(
                "token sequence has {incoming} entries, expected {expected} \
                 (grid tokens + class token = {})",
                self.cls_token
            )));
        }

        if self.cls_token {
            let cls = x_t.narrow(1, 0, 1)?;
            Ok(Tensor::cat(&[&cls, &x], 1)?)
        } else {
            Ok(x)
        }
    }
}

pub struct FcuUp {
    conv_project: Conv2d,
    bn: BatchNorm,
    up_stride: usize,
    cls_token: bool,
}

impl FcuUp {
    pub fn new(
        embed_dims: usize,
        out_channels: usize,
        up_stride: usize,
        cls_token: bool,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_project = init::conv2d(
            embed_dims,
            out_channels,
            1,
            Conv2dConfig::default(),
            true,
            vb.pp("conv_project"),
        )?;
        let bn = init::batch_norm(out_channels, eps, vb.pp("bn"))?;
        Ok(Self {
            conv_project,
            bn,
            up_stride,
            cls_token,
        })
    }

    /// Restore a feature map from tokens laid out on a `height × width` grid.
    pub fn forward_t(
        &self,
        x_t: &Tensor,
        height: usize,
        width: usize,
        phase: Phase,
    ) -> Result<Tensor> {
        let (batch, len, channels) = x_t.dims3()?;
        let offset = usize::from(self.cls_token);
        if len != height * width + offset {
            return Err(Error::Shape(format!(
                "token sequence has {len} entries, expected {height}x{width} grid \
                 + class token = {}",
                self.cls_token
            )));
        }

        let tokens = x_t.narrow(1, offset, height * width)?;
        let x = tokens
            .transpose(1, 2)?
            .reshape((batch, channels, height, width))?;
        let x = self.conv_project.forward(&x)?;
        let x = self.bn.forward_t(&x, phase.batch_stats)?.relu()?;
        Ok(x.upsample_nearest2d(height * self.up_stride, width * self.up_stride)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn down_pools_to_token_grid_and_keeps_cls() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let down = FcuDown::new(16, 32, 4, true, 1e-6, vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 16, 16, 16), &device).unwrap();
        let x_t = Tensor::randn(0.0_f32, 1.0, (2, 17, 32), &device).unwrap();
        let out = down.forward(&x, &x_t).unwrap();
        assert_eq!(out.dims(), &[2, 17, 32]);

        let cls_in: Vec<f32> = x_t.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let cls_out: Vec<f32> = out.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(cls_in, cls_out);
    }

    #[test]
    fn down_without_cls_token() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let down = FcuDown::new(16, 32, 2, false, 1e-6, vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 16, 8, 8), &device).unwrap();
        let x_t = Tensor::zeros((1, 16, 32), DType::F32, &device).unwrap();
        assert_eq!(down.forward(&x, &x_t).unwrap().dims(), &[1, 16, 32]);
    }

    #[test]
    fn down_rejects_inconsistent_class_token() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let down = FcuDown::new(16, 32, 2, true, 1e-6, vb).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 16, 8, 8), &device).unwrap();
        // 16 grid tokens without the class token
        let x_t = Tensor::zeros((1, 16, 32), DType::F32, &device).unwrap();
        assert!(matches!(down.forward(&x, &x_t), Err(Error::Shape(_))));
    }

    #[test]
    fn up_restores_spatial_resolution() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = FcuUp::new(32, 8, 4, true, 1e-6, vb).unwrap();
        let x_t = Tensor::randn(0.0_f32, 1.0, (2, 17, 32), &device).unwrap();
        let out = up.forward_t(&x_t, 4, 4, Phase::EVAL).unwrap();
        assert_eq!(out.dims(), &[2, 8, 16, 16]);
    }

    #[test]
    fn up_rejects_grid_mismatch() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = FcuUp::new(32, 8, 2, false, 1e-6, vb).unwrap();
        let x_t = Tensor::randn(0.0_f32, 1.0, (1, 17, 32), &device).unwrap();
        assert!(matches!(
            up.forward_t(&x_t, 4, 4, Phase::EVAL),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn up_ignores_class_token_values() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = FcuUp::new(8, 4, 1, true, 1e-6, vb).unwrap();
        let grid = Tensor::randn(0.0_f32, 1.0, (1, 4, 8), &device).unwrap();
        let cls_a = Tensor::zeros((1, 1, 8), DType::F32, &device).unwrap();
        let cls_b = Tensor::ones((1, 1, 8), DType::F32, &device).unwrap();
        let a = Tensor::cat(&[&cls_a, &grid], 1).unwrap();
        let b = Tensor::cat(&[&cls_b, &grid], 1).unwrap();
        let out_a = up.forward_t(&a, 2, 2, Phase::EVAL).unwrap();
        let out_b = up.forward_t(&b, 2, 2, Phase::EVAL).unwrap();
        let diff: f32 = (&out_a - &out_b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }
}
