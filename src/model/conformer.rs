//! Conformer backbone.
//!
//! ## Architecture
//!
//! ```text
//! [B, 3, H, W]
//!   ─→ conv1 7×7/2 → bn1 → ReLU → maxpool 3×3/2                 x_base [B, 64, H/4, W/4]
//!
//! stage 1:
//!   x   = conv_1(x_base)                                        [B, c1, H/4, W/4]
//!   x_t = trans_patch_conv(x_base) → flatten → [cls ‖ tokens]   [B, 1 + N, E]
//!   x_t = trans_1(x_t)
//!
//! stages 2..=depths (conv_trans_{i}):
//!   group 1  c1,  dw = patch/4                                  H/4
//!   group 2  2c1, dw = patch/8,  first stage stride 2           H/8
//!   group 3  4c1, dw = patch/16, first stage stride 2           H/16
//!   last stage's fusion block strides once more                 H/32
//!
//! out_indices: (avg-pool(x) [B, C], trans_norm(x_t)[:, 0] or mean [B, E])
//! ```
//!
//! For `tiny` on a 224×224 input: `N = 196`, `c1 = 64`, final `C = 256`,
//! `E = 384`.

use candle_core::{DType, Device, IndexOp, Module, ModuleT, Tensor, Var};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, LayerNorm, VarBuilder, VarMap};

use super::Phase;
use super::conv_block::{ConvBlock, ConvBlockConfig};
use super::conv_trans::{ConvTransBlock, ConvTransConfig};
use super::init;
use super::transformer::{EncoderLayerConfig, TransformerEncoderLayer};
use crate::checkpoint;
use crate::config::{ConformerConfig, InitCfg, STEM_CHANNELS, StageLayout};
use crate::{Error, Result};

/// Features emitted at one requested stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub index: usize,
    /// Globally average-pooled conv branch, `[B, C]`.
    pub conv: Tensor,
    /// Normalized class token, or the mean over tokens without one, `[B, E]`.
    pub token: Tensor,
}

pub struct Conformer {
    layout: StageLayout,
    /// Parameter-name prefix of this module inside its `VarMap`.
    prefix: String,
    cls_token: Option<Tensor>,
    conv1: Conv2d,
    bn1: BatchNorm,
    conv_1: ConvBlock,
    trans_patch_conv: Conv2d,
    trans_1: TransformerEncoderLayer,
    stages: Vec<ConvTransBlock>,
    trans_norm: LayerNorm,
    out_indices: Vec<usize>,
    norm_eval: bool,
    frozen_stages: usize,
    init_cfg: Option<InitCfg>,
}

impl Conformer {
    /// Build the backbone. All configuration errors surface here, before
    /// any parameter is created.
    pub fn new(cfg: &ConformerConfig, vb: VarBuilder) -> Result<Self> {
        let layout = cfg.layout()?;
        let arch = layout.arch;
        let eps = cfg.norm_cfg.eps;

        let cls_token = if cfg.cls_token {
            Some(vb.get_with_hints(
                (1, 1, arch.embed_dims),
                "cls_token",
                init::trunc_normal(init::TRUNC_NORMAL_STD),
            )?)
        } else {
            None
        };

        // Stem: 1/4 resolution.
        let conv1 = init::conv2d(
            3,
            STEM_CHANNELS,
            7,
            Conv2dConfig {
                padding: 3,
                stride: 2,
                ..Default::default()
            },
            false,
            vb.pp("conv1"),
        )?;
        let bn1 = init::batch_norm(STEM_CHANNELS, 1e-5, vb.pp("bn1"))?;

        // Stage 1.
        let conv_1 = ConvBlock::new(
            &ConvBlockConfig {
                res_conv: true,
                eps,
                ..ConvBlockConfig::new(STEM_CHANNELS, layout.stage_1_channels)
            },
            vb.pp("conv_1"),
        )?;
        let trans_patch_conv = init::conv2d(
            STEM_CHANNELS,
            arch.embed_dims,
            layout.trans_dw_stride,
            Conv2dConfig {
                stride: layout.trans_dw_stride,
                ..Default::default()
            },
            true,
            vb.pp("trans_patch_conv"),
        )?;
        let trans_1 = TransformerEncoderLayer::new(
            &EncoderLayerConfig {
                // Stage 1's encoder carries no dropout, only drop path.
                drop_path_rate: layout.drop_path_rates[0],
                qkv_bias: cfg.qkv_bias,
                eps,
                ..EncoderLayerConfig::new(arch.embed_dims, arch.num_heads, cfg.mlp_ratio)
            },
            vb.pp("trans_1"),
        )?;

        // Stages 2..=depths, addressed by position; names keep the
        // checkpoint layout.
        let stages = layout
            .stages
            .iter()
            .map(|stage| {
                ConvTransBlock::new(
                    &ConvTransConfig {
                        stage: *stage,
                        embed_dims: arch.embed_dims,
                        num_heads: arch.num_heads,
                        mlp_ratio: cfg.mlp_ratio,
                        qkv_bias: cfg.qkv_bias,
                        cls_token: cfg.cls_token,
                        drop_rate: cfg.drop_rate,
                        attn_drop_rate: cfg.attn_drop_rate,
                        groups: cfg.stage_cfgs.groups,
                        num_med_block: cfg.stage_cfgs.num_med_block,
                        eps,
                    },
                    vb.pp(format!("conv_trans_{}", stage.index)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let trans_norm = init::layer_norm(arch.embed_dims, 1e-5, vb.pp("trans_norm"))?;

        tracing::debug!(
            embed_dims = arch.embed_dims,
            num_heads = arch.num_heads,
            depths = arch.depths,
            stage_1_channels = layout.stage_1_channels,
            final_channels = layout.final_channels(),
            cls_token = cfg.cls_token,
            "built conformer"
        );

        Ok(Self {
            layout,
            prefix: vb.prefix(),
            cls_token,
            conv1,
            bn1,
            conv_1,
            trans_patch_conv,
            trans_1,
            stages,
            trans_norm,
            out_indices: cfg.out_indices.clone(),
            norm_eval: cfg.norm_eval,
            frozen_stages: cfg.frozen_stages,
            init_cfg: cfg.init_cfg.clone(),
        })
    }

    /// Build on a fresh `VarMap` and run [`Self::init_weights`].
    pub fn build(cfg: &ConformerConfig, dtype: DType, device: &Device) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let model = Self::new(cfg, vb)?;
        model.init_weights(&varmap)?;
        Ok((model, varmap))
    }

    /// Finish initialization of parameters stored in `varmap`.
    ///
    /// With a `Pretrained` init config the checkpoint is loaded non-strictly
    /// and the default hooks are skipped. Otherwise, or when the checkpoint
    /// file does not exist, every ConvBlock gets `zero_init_last_bn` on top
    /// of the construction-time defaults.
    pub fn init_weights(&self, varmap: &VarMap) -> Result<()> {
        match &self.init_cfg {
            Some(InitCfg::Pretrained { checkpoint, prefix }) if checkpoint.exists() => {
                checkpoint::load_checkpoint_scoped(
                    varmap,
                    checkpoint,
                    prefix.as_deref(),
                    &self.prefix,
                )?;
                return Ok(());
            }
            Some(InitCfg::Pretrained { checkpoint, .. }) => {
                tracing::warn!(
                    path = %checkpoint.display(),
                    "pretrained checkpoint not found for Conformer, training starts from scratch"
                );
            }
            None => {
                tracing::warn!("no pre-trained weights for Conformer, training starts from scratch");
            }
        }

        for block in self.conv_blocks() {
            block.zero_init_last_bn(varmap)?;
        }
        Ok(())
    }

    /// Every ConvBlock of the network, stage order.
    pub fn conv_blocks(&self) -> impl Iterator<Item = &ConvBlock> {
        std::iter::once(&self.conv_1).chain(self.stages.iter().flat_map(|s| s.conv_blocks()))
    }

    /// Inference forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Vec<StageOutput>> {
        self.forward_t(x, false)
    }

    /// Forward pass on `[B, 3, H, W]`, one [`StageOutput`] per requested
    /// stage, in stage order.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Vec<StageOutput>> {
        let active = if train {
            Phase::training(self.norm_eval)
        } else {
            Phase::EVAL
        };
        let phase_of = |stage: usize| {
            if stage <= self.frozen_stages {
                Phase::EVAL
            } else {
                active
            }
        };
        let batch = x.dim(0)?;

        // Stem and stage 1 freeze together.
        let stem = phase_of(1);
        let x = self.conv1.forward(x)?;
        let x = self.bn1.forward_t(&x, stem.batch_stats)?.relu()?;
        // Zero padding matches -inf padding here: inputs are post-ReLU.
        let x_base = x
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        let mut x = self.conv_1.forward(&x_base, None, stem)?;
        let x_t = self
            .trans_patch_conv
            .forward(&x_base)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let x_t = match &self.cls_token {
            Some(cls) => {
                let cls = cls
                    .expand((batch, 1, self.layout.arch.embed_dims))?
                    .contiguous()?;
                Tensor::cat(&[&cls, &x_t], 1)?
            }
            None => x_t,
        };
        let mut x_t = self.trans_1.forward_t(&x_t, stem)?;

        let mut outputs = Vec::with_capacity(self.out_indices.len());
        for stage in &self.stages {
            let index = stage.index();
            (x, x_t) = stage.forward_t(&x, &x_t, phase_of(index))?;
            if self.out_indices.contains(&index) {
                outputs.push(self.stage_output(index, &x, &x_t)?);
            }
        }
        Ok(outputs)
    }

    fn stage_output(&self, index: usize, x: &Tensor, x_t: &Tensor) -> Result<StageOutput> {
        let conv = x.flatten_from(2)?.mean(2)?;
        let normed = self.trans_norm.forward(x_t)?;
        let token = if self.cls_token.is_some() {
            normed.i((.., 0))?
        } else {
            normed.mean(1)?
        };
        Ok(StageOutput { index, conv, token })
    }

    /// Parameters an optimizer should update: everything outside the frozen
    /// stages.
    pub fn trainable_vars(&self, varmap: &VarMap) -> Result<Vec<Var>> {
        let frozen = self.frozen_prefixes();
        let scope = self.scoped("");
        let data = varmap
            .data()
            .lock()
            .map_err(|_| Error::WeightLoad("parameter store lock poisoned".to_string()))?;
        let mut vars: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| name.starts_with(&scope))
            .filter(|(name, _)| !frozen.iter().any(|p| name.starts_with(p.as_str())))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(b.0));
        Ok(vars.into_iter().map(|(_, var)| var.clone()).collect())
    }

    /// Parameter-name prefixes of the frozen stages.
    fn frozen_prefixes(&self) -> Vec<String> {
        if self.frozen_stages == 0 {
            return Vec::new();
        }
        let mut prefixes: Vec<String> = [
            "cls_token",
            "conv1.",
            "bn1.",
            "conv_1.",
            "trans_patch_conv.",
            "trans_1.",
        ]
        .iter()
        .map(|name| self.scoped(name))
        .collect();
        prefixes.extend(
            (2..=self.frozen_stages).map(|i| self.scoped(&format!("conv_trans_{i}."))),
        );
        prefixes
    }

    fn scoped(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    pub fn stages(&self) -> &[ConvTransBlock] {
        &self.stages
    }

    pub fn has_cls_token(&self) -> bool {
        self.cls_token.is_some()
    }

    pub fn embed_dims(&self) -> usize {
        self.layout.arch.embed_dims
    }

    pub fn out_indices(&self) -> &[usize] {
        &self.out_indices
    }
}
