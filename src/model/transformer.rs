//! Pre-norm Transformer encoder layer of the token branch.
//!
//! ```text
//! x = x + drop_path(attn(ln1(x)))
//! x = x + drop_path(ffn(ln2(x)))
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! ln1.{weight,bias}
//! attn.qkv.{weight,bias}       : Linear(E, 3E), bias only with qkv_bias
//! attn.proj.{weight,bias}      : Linear(E, E)
//! ln2.{weight,bias}
//! ffn.layers.0.0.{weight,bias} : Linear(E, F)
//! ffn.layers.1.{weight,bias}   : Linear(F, E)
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};

use super::Phase;
use super::drop::DropPath;
use super::init;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderLayerConfig {
    pub embed_dims: usize,
    pub num_heads: usize,
    pub feedforward_channels: usize,
    pub drop_rate: f64,
    pub attn_drop_rate: f64,
    pub drop_path_rate: f64,
    pub qkv_bias: bool,
    pub eps: f64,
}

impl EncoderLayerConfig {
    pub fn new(embed_dims: usize, num_heads: usize, mlp_ratio: f64) -> Self {
        Self {
            embed_dims,
            num_heads,
            feedforward_channels: (embed_dims as f64 * mlp_ratio) as usize,
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.0,
            qkv_bias: true,
            eps: 1e-6,
        }
    }
}

/// Multi-head softmax self-attention with a fused QKV projection.
pub struct MultiheadAttention {
    qkv: Linear,
    proj: Linear,
    attn_drop: Dropout,
    proj_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiheadAttention {
    pub fn new(cfg: &EncoderLayerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dims;
        let head_dim = dim / cfg.num_heads;
        Ok(Self {
            qkv: init::linear(dim, dim * 3, cfg.qkv_bias, vb.pp("qkv"))?,
            proj: init::linear(dim, dim, true, vb.pp("proj"))?,
            attn_drop: Dropout::new(cfg.attn_drop_rate as f32),
            proj_drop: Dropout::new(cfg.drop_rate as f32),
            num_heads: cfg.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// `[B, N, E]` → `[B, N, E]`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;

        // [B, N, 3E] → [3, B, H, N, D]
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((batch, seq_len, 3, self.num_heads, self.head_dim))?
            .permute([2, 0, 3, 1, 4])?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let attn = self.attn_drop.forward(&attn, train)?;

        // [B, H, N, D] → [B, N, E]
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, dim))?;
        let out = self.proj.forward(&out)?;
        Ok(self.proj_drop.forward(&out, train)?)
    }
}

/// Linear → GELU → Dropout → Linear → Dropout.
pub struct Ffn {
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl Ffn {
    pub fn new(cfg: &EncoderLayerConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("layers");
        Ok(Self {
            fc1: init::linear(
                cfg.embed_dims,
                cfg.feedforward_channels,
                true,
                vb.pp("0").pp("0"),
            )?,
            fc2: init::linear(cfg.feedforward_channels, cfg.embed_dims, true, vb.pp("1"))?,
            dropout: Dropout::new(cfg.drop_rate as f32),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu_erf()?;
        let h = self.dropout.forward(&h, train)?;
        let h = self.fc2.forward(&h)?;
        Ok(self.dropout.forward(&h, train)?)
    }
}

pub struct TransformerEncoderLayer {
    ln1: LayerNorm,
    attn: MultiheadAttention,
    ln2: LayerNorm,
    ffn: Ffn,
    drop_path: DropPath,
}

impl TransformerEncoderLayer {
    pub fn new(cfg: &EncoderLayerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln1: init::layer_norm(cfg.embed_dims, cfg.eps, vb.pp("ln1"))?,
            attn: MultiheadAttention::new(cfg, vb.pp("attn"))?,
            ln2: init::layer_norm(cfg.embed_dims, cfg.eps, vb.pp("ln2"))?,
            ffn: Ffn::new(cfg, vb.pp("ffn"))?,
            drop_path: DropPath::new(cfg.drop_path_rate),
        })
    }

    pub fn forward_t(&self, x: &Tensor, phase: Phase) -> Result<Tensor> {
        let h = self.attn.forward_t(&self.ln1.forward(x)?, phase.train)?;
        let x = (x + self.drop_path.forward_t(&h, phase.train)?)?;
        let h = self.ffn.forward_t(&self.ln2.forward(&x)?, phase.train)?;
        Ok((&x + self.drop_path.forward_t(&h, phase.train)?)?)
    }

    pub fn drop_path_rate(&self) -> f64 {
        self.drop_path.drop_prob()
    }
}
