//! One dual-branch fusion stage.
//!
//! ```text
//! x ──cnn_block──→ x ─────────────────────────────fusion_block(x, x_t_r)──→ x'
//!        └─ x2 ─squeeze_block─→ x_st                    ↑
//! x_t ──────────────────────(+ x_st)─trans_block─→ x_t' ─expand_block─→ x_t_r
//! ```
//!
//! Conv information enters the token branch only through `squeeze_block`;
//! token information returns only through `expand_block` into the fusion
//! block's second convolution.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::Phase;
use super::conv_block::{ConvBlock, ConvBlockConfig};
use super::fcu::{FcuDown, FcuUp};
use super::transformer::{EncoderLayerConfig, TransformerEncoderLayer};
use crate::config::{EXPANSION, StageSpec};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvTransConfig {
    pub stage: StageSpec,
    pub embed_dims: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    pub cls_token: bool,
    pub drop_rate: f64,
    pub attn_drop_rate: f64,
    pub groups: usize,
    pub num_med_block: usize,
    pub eps: f64,
}

pub struct ConvTransBlock {
    index: usize,
    dw_stride: usize,
    cls_token: bool,
    cnn_block: ConvBlock,
    fusion_block: ConvBlock,
    squeeze_block: FcuDown,
    expand_block: FcuUp,
    trans_block: TransformerEncoderLayer,
}

impl ConvTransBlock {
    pub fn new(cfg: &ConvTransConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.num_med_block > 0 {
            return Err(Error::Unsupported(format!(
                "stage {}: num_med_block = {} is not implemented",
                cfg.stage.index, cfg.num_med_block
            )));
        }

        let stage = &cfg.stage;
        let med = stage.out_channels / EXPANSION;

        let cnn_block = ConvBlock::new(
            &ConvBlockConfig {
                stride: stage.stride,
                res_conv: stage.res_conv,
                groups: cfg.groups,
                eps: cfg.eps,
                ..ConvBlockConfig::new(stage.in_channels, stage.out_channels)
            },
            vb.pp("cnn_block"),
        )?;

        // The terminal stage downsamples once more before pooling.
        let fusion_block = ConvBlock::new(
            &ConvBlockConfig {
                stride: if stage.last_fusion { 2 } else { 1 },
                res_conv: stage.last_fusion,
                groups: cfg.groups,
                drop_path_rate: stage.drop_path_rate,
                eps: cfg.eps,
                ..ConvBlockConfig::new(stage.out_channels, stage.out_channels)
            },
            vb.pp("fusion_block"),
        )?;

        let squeeze_block = FcuDown::new(
            med,
            cfg.embed_dims,
            stage.dw_stride,
            cfg.cls_token,
            cfg.eps,
            vb.pp("squeeze_block"),
        )?;
        let expand_block = FcuUp::new(
            cfg.embed_dims,
            med,
            stage.dw_stride,
            cfg.cls_token,
            cfg.eps,
            vb.pp("expand_block"),
        )?;

        let trans_block = TransformerEncoderLayer::new(
            &EncoderLayerConfig {
                drop_rate: cfg.drop_rate,
                attn_drop_rate: cfg.attn_drop_rate,
                drop_path_rate: stage.drop_path_rate,
                qkv_bias: cfg.qkv_bias,
                eps: cfg.eps,
                ..EncoderLayerConfig::new(cfg.embed_dims, cfg.num_heads, cfg.mlp_ratio)
            },
            vb.pp("trans_block"),
        )?;

        tracing::debug!(
            stage = stage.index,
            in_channels = stage.in_channels,
            out_channels = stage.out_channels,
            stride = stage.stride,
            dw_stride = stage.dw_stride,
            drop_path_rate = stage.drop_path_rate,
            last_fusion = stage.last_fusion,
            "built fusion stage"
        );

        Ok(Self {
            index: stage.index,
            dw_stride: stage.dw_stride,
            cls_token: cfg.cls_token,
            cnn_block,
            fusion_block,
            squeeze_block,
            expand_block,
            trans_block,
        })
    }

    /// Advance both branches one stage: `(x, x_t) → (x', x_t')`.
    pub fn forward_t(&self, x: &Tensor, x_t: &Tensor, phase: Phase) -> Result<(Tensor, Tensor)> {
        let (x, x2) = self.cnn_block.forward_with_intermediate(x, None, phase)?;
        let (_, _, height, width) = x2.dims4()?;

        let x_st = self.squeeze_block.forward(&x2, x_t)?;
        let x_t = self.trans_block.forward_t(&(x_st + x_t)?, phase)?;

        let x_t_r = self.expand_block.forward_t(
            &x_t,
            height / self.dw_stride,
            width / self.dw_stride,
            phase,
        )?;
        let x = self.fusion_block.forward(&x, Some(&x_t_r), phase)?;

        Ok((x, x_t))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn has_cls_token(&self) -> bool {
        self.cls_token
    }

    pub fn conv_blocks(&self) -> [&ConvBlock; 2] {
        [&self.cnn_block, &self.fusion_block]
    }

    pub fn fusion_block(&self) -> &ConvBlock {
        &self.fusion_block
    }

    pub fn trans_block(&self) -> &TransformerEncoderLayer {
        &self.trans_block
    }
}
