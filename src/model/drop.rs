//! Stochastic depth.

use candle_core::Tensor;

use crate::Result;

/// Drops the whole residual branch per sample with probability `drop_prob`
/// while training, rescaling the kept samples by `1 / (1 - drop_prob)`.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    pub fn new(drop_prob: f64) -> Self {
        Self { drop_prob }
    }

    pub fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob <= 0.0 {
            return Ok(x.clone());
        }
        if self.drop_prob >= 1.0 {
            return Ok(x.zeros_like()?);
        }
        let keep_prob = 1.0 - self.drop_prob;
        // [B, 1, 1, ...] mask broadcast over everything but the batch dim
        let mut mask_shape = vec![1; x.rank()];
        mask_shape[0] = x.dim(0)?;
        let mask = Tensor::rand(0f32, 1f32, mask_shape, x.device())?
            .to_dtype(x.dtype())?
            .affine(1.0, keep_prob)?
            .floor()?;
        let scaled = mask.affine(1.0 / keep_prob, 0.0)?;
        Ok(x.broadcast_mul(&scaled)?)
    }
}
