//! Configuration for the Conformer backbone.
//!
//! [`ConformerConfig`] carries the constructor arguments; [`ConformerConfig::layout`]
//! resolves the architecture and validates everything up front, producing the
//! per-stage [`StageLayout`] the model is built from.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Output channels of the convolutional stem.
pub const STEM_CHANNELS: usize = 64;

/// Bottleneck expansion of a ConvBlock (`med_planes = out / EXPANSION`).
pub const EXPANSION: usize = 4;

/// Keys a custom architecture mapping must carry, no more and no less.
pub const ARCH_KEYS: [&str; 4] = ["channel_ratio", "depths", "embed_dims", "num_heads"];

/// Names accepted by [`Arch::Preset`] (case-insensitive).
pub const PRESET_NAMES: [&str; 6] = ["t", "tiny", "s", "small", "b", "base"];

/// Resolved architecture hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchSettings {
    pub embed_dims: usize,
    pub channel_ratio: usize,
    pub num_heads: usize,
    pub depths: usize,
}

impl ArchSettings {
    pub const TINY: Self = Self {
        embed_dims: 384,
        channel_ratio: 1,
        num_heads: 6,
        depths: 12,
    };

    pub const SMALL: Self = Self {
        embed_dims: 384,
        channel_ratio: 4,
        num_heads: 6,
        depths: 12,
    };

    pub const BASE: Self = Self {
        embed_dims: 576,
        channel_ratio: 6,
        num_heads: 9,
        depths: 12,
    };

    /// Look up a named preset.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "t" | "tiny" => Some(Self::TINY),
            "s" | "small" => Some(Self::SMALL),
            "b" | "base" => Some(Self::BASE),
            _ => None,
        }
    }

    /// Parse a custom mapping. The key set must equal [`ARCH_KEYS`] exactly.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let keys: BTreeSet<&str> = map.keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = ARCH_KEYS.into_iter().collect();
        if keys != expected {
            return Err(Error::Config(format!(
                "custom arch needs exactly the keys {expected:?}, got {keys:?}"
            )));
        }
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| Error::Config(format!("custom arch: {e}")))
    }
}

/// Architecture selector: a preset name or a custom mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arch {
    Preset(String),
    Custom(Map<String, Value>),
}

impl Default for Arch {
    fn default() -> Self {
        Arch::Preset("T".to_string())
    }
}

impl From<ArchSettings> for Arch {
    fn from(settings: ArchSettings) -> Self {
        let mut map = Map::new();
        map.insert("embed_dims".into(), settings.embed_dims.into());
        map.insert("channel_ratio".into(), settings.channel_ratio.into());
        map.insert("num_heads".into(), settings.num_heads.into());
        map.insert("depths".into(), settings.depths.into());
        Arch::Custom(map)
    }
}

impl Arch {
    pub fn preset(name: impl Into<String>) -> Self {
        Arch::Preset(name.into())
    }

    /// Resolve into concrete settings, failing on unknown names or bad mappings.
    pub fn resolve(&self) -> Result<ArchSettings> {
        match self {
            Arch::Preset(name) => ArchSettings::preset(name).ok_or_else(|| {
                Error::Config(format!(
                    "arch '{name}' is not in the default archs {PRESET_NAMES:?}"
                ))
            }),
            Arch::Custom(map) => ArchSettings::from_map(map),
        }
    }
}

/// Normalization settings for the conv-branch BatchNorms and the token-branch
/// LayerNorms inside the fusion stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormConfig {
    pub eps: f64,
}

impl Default for NormConfig {
    fn default() -> Self {
        Self { eps: 1e-6 }
    }
}

/// Settings applied to every ConvTransBlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageCfgs {
    /// Groups of the 3×3 convolution in both ConvBlocks of a stage.
    pub groups: usize,
    /// Extra conv blocks between the branches. Only `0` is implemented.
    pub num_med_block: usize,
}

impl Default for StageCfgs {
    fn default() -> Self {
        Self {
            groups: 1,
            num_med_block: 0,
        }
    }
}

/// Weight initialization source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InitCfg {
    /// Load weights from a checkpoint instead of the default init.
    Pretrained {
        checkpoint: PathBuf,
        /// Only keys under this prefix are used, with the prefix removed
        /// (e.g. `"backbone."` for a full classifier checkpoint).
        #[serde(default)]
        prefix: Option<String>,
    },
}

/// Constructor arguments of [`crate::model::conformer::Conformer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConformerConfig {
    pub arch: Arch,
    pub patch_size: usize,
    pub base_channel: usize,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    pub cls_token: bool,
    /// Dropout after the attention projection and inside the FFN.
    pub drop_rate: f64,
    /// Dropout on the attention weights.
    pub attn_drop_rate: f64,
    pub drop_path_rate: f64,
    /// Keep BatchNorm layers on running statistics while training.
    pub norm_eval: bool,
    pub frozen_stages: usize,
    /// Stage indices (`2..=depths`) whose outputs are returned.
    pub out_indices: Vec<usize>,
    pub norm_cfg: NormConfig,
    pub stage_cfgs: StageCfgs,
    pub init_cfg: Option<InitCfg>,
}

impl Default for ConformerConfig {
    fn default() -> Self {
        Self {
            arch: Arch::default(),
            patch_size: 16,
            base_channel: 64,
            mlp_ratio: 4.0,
            qkv_bias: true,
            cls_token: true,
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.0,
            norm_eval: true,
            frozen_stages: 0,
            out_indices: vec![12],
            norm_cfg: NormConfig::default(),
            stage_cfgs: StageCfgs::default(),
            init_cfg: None,
        }
    }
}

/// One ConvTransBlock's construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageSpec {
    /// Stage index, `2..=depths`.
    pub index: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub res_conv: bool,
    /// Ratio between the conv resolution and the token grid.
    pub dw_stride: usize,
    pub drop_path_rate: f64,
    pub last_fusion: bool,
}

/// Fully resolved, validated stage plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageLayout {
    pub arch: ArchSettings,
    pub stage_1_channels: usize,
    /// Kernel and stride of the token patch embedding on the stem output.
    pub trans_dw_stride: usize,
    /// `linspace(0, drop_path_rate, depths)`; stage `i` uses entry `i - 1`.
    pub drop_path_rates: Vec<f64>,
    pub stages: Vec<StageSpec>,
}

impl StageLayout {
    /// Channels of the conv branch after the last stage.
    pub fn final_channels(&self) -> usize {
        self.stages
            .last()
            .map_or(self.stage_1_channels, |s| s.out_channels)
    }

    /// Number of spatial tokens for an input of `height × width` pixels.
    pub fn num_patches(&self, height: usize, width: usize) -> usize {
        let patch = self.trans_dw_stride * 4;
        (height / patch) * (width / patch)
    }
}

/// Linearly increasing stochastic-depth rates from `0` to `rate`.
pub fn drop_path_schedule(rate: f64, depths: usize) -> Vec<f64> {
    match depths {
        0 => Vec::new(),
        1 => vec![0.0],
        n => (0..n)
            .map(|i| rate * (i as f64 / (n - 1) as f64))
            .collect(),
    }
}

impl ConformerConfig {
    pub fn new(arch: impl Into<Arch>) -> Self {
        Self {
            arch: arch.into(),
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Resolve the arch, validate all settings and compute the stage plan.
    pub fn layout(&self) -> Result<StageLayout> {
        let arch = self.arch.resolve()?;
        self.validate(&arch)?;

        let drop_path_rates = drop_path_schedule(self.drop_path_rate, arch.depths);
        let c1 = self.base_channel * arch.channel_ratio;
        let trans_dw_stride = self.patch_size / 4;
        let per_group = arch.depths / 3;

        let mut stages = Vec::with_capacity(arch.depths - 1);
        for index in 2..=per_group {
            stages.push(StageSpec {
                index,
                in_channels: c1,
                out_channels: c1,
                stride: 1,
                res_conv: false,
                dw_stride: trans_dw_stride,
                drop_path_rate: drop_path_rates[index - 1],
                last_fusion: false,
            });
        }

        let groups = [
            (per_group + 1, c1, c1 * 2, trans_dw_stride / 2),
            (2 * per_group + 1, c1 * 2, c1 * 4, trans_dw_stride / 4),
        ];
        for (start, in_channels, out_channels, dw_stride) in groups {
            for index in start..start + per_group {
                let first = index == start;
                stages.push(StageSpec {
                    index,
                    in_channels: if first { in_channels } else { out_channels },
                    out_channels,
                    stride: if first { 2 } else { 1 },
                    res_conv: first,
                    dw_stride,
                    drop_path_rate: drop_path_rates[index - 1],
                    last_fusion: index == arch.depths,
                });
            }
        }

        Ok(StageLayout {
            arch,
            stage_1_channels: c1,
            trans_dw_stride,
            drop_path_rates,
            stages,
        })
    }

    fn validate(&self, arch: &ArchSettings) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if arch.depths == 0 || arch.depths % 3 != 0 {
            return fail(format!(
                "depths must be a positive multiple of 3, got {}",
                arch.depths
            ));
        }
        if arch.embed_dims == 0 || arch.num_heads == 0 || arch.embed_dims % arch.num_heads != 0 {
            return fail(format!(
                "embed_dims ({}) must be divisible by num_heads ({})",
                arch.embed_dims, arch.num_heads
            ));
        }
        if self.patch_size == 0 || self.patch_size % 16 != 0 {
            return fail(format!(
                "patch_size must be a positive multiple of 16, got {}",
                self.patch_size
            ));
        }
        let c1 = self.base_channel * arch.channel_ratio;
        if c1 == 0 || c1 % EXPANSION != 0 {
            return fail(format!(
                "base_channel * channel_ratio must be a positive multiple of {EXPANSION}, got {c1}"
            ));
        }
        let groups = self.stage_cfgs.groups;
        if groups == 0 || (c1 / EXPANSION) % groups != 0 {
            return fail(format!(
                "stage_cfgs.groups ({groups}) must divide the bottleneck width {}",
                c1 / EXPANSION
            ));
        }
        if !(self.mlp_ratio > 0.0) {
            return fail(format!("mlp_ratio must be positive, got {}", self.mlp_ratio));
        }
        if !(self.norm_cfg.eps > 0.0) {
            return fail(format!("norm_cfg.eps must be positive, got {}", self.norm_cfg.eps));
        }
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("attn_drop_rate", self.attn_drop_rate),
            ("drop_path_rate", self.drop_path_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return fail(format!("{name} must be in [0, 1), got {rate}"));
            }
        }
        if let Some(&bad) = self
            .out_indices
            .iter()
            .find(|&&i| i < 2 || i > arch.depths)
        {
            return fail(format!(
                "out_indices entry {bad} is outside the fusion stages 2..={}",
                arch.depths
            ));
        }
        if self.frozen_stages > arch.depths {
            return fail(format!(
                "frozen_stages ({}) exceeds depths ({})",
                self.frozen_stages, arch.depths
            ));
        }
        if self.stage_cfgs.num_med_block > 0 {
            return Err(Error::Unsupported(format!(
                "num_med_block = {} is not implemented",
                self.stage_cfgs.num_med_block
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_matches_reference_backbone() {
        let cfg = ConformerConfig::default();
        assert_eq!(cfg.arch.resolve().unwrap(), ArchSettings::TINY);
        assert_eq!(cfg.patch_size, 16);
        assert_eq!(cfg.base_channel, 64);
        assert!(cfg.qkv_bias);
        assert!(cfg.cls_token);
        assert!(cfg.norm_eval);
        assert_eq!(cfg.out_indices, vec![12]);
        assert_eq!(cfg.norm_cfg.eps, 1e-6);
    }

    #[test]
    fn preset_names_are_case_insensitive() {
        assert_eq!(Arch::preset("TINY").resolve().unwrap(), ArchSettings::TINY);
        assert_eq!(Arch::preset("s").resolve().unwrap(), ArchSettings::SMALL);
        assert_eq!(Arch::preset("Base").resolve().unwrap(), ArchSettings::BASE);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let err = Arch::preset("huge").resolve().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("huge"));
    }

    #[test]
    fn custom_arch_requires_exact_keys() {
        let ok = json!({"embed_dims": 96, "channel_ratio": 1, "num_heads": 4, "depths": 6});
        let Value::Object(map) = ok else { unreachable!() };
        let settings = Arch::Custom(map).resolve().unwrap();
        assert_eq!(settings.embed_dims, 96);
        assert_eq!(settings.depths, 6);

        let missing = json!({"embed_dims": 96, "channel_ratio": 1, "depths": 6});
        let Value::Object(map) = missing else { unreachable!() };
        assert!(matches!(Arch::Custom(map).resolve(), Err(Error::Config(_))));

        let extra = json!({
            "embed_dims": 96, "channel_ratio": 1, "num_heads": 4, "depths": 6, "mlp": 2
        });
        let Value::Object(map) = extra else { unreachable!() };
        assert!(matches!(Arch::Custom(map).resolve(), Err(Error::Config(_))));

        let typo = json!({"embed_dims": 96, "channel_ratio": 1, "num_head": 4, "depths": 6});
        let Value::Object(map) = typo else { unreachable!() };
        assert!(matches!(Arch::Custom(map).resolve(), Err(Error::Config(_))));
    }

    #[test]
    fn custom_arch_with_wrong_value_type_is_rejected() {
        let bad = json!({"embed_dims": "wide", "channel_ratio": 1, "num_heads": 4, "depths": 6});
        let Value::Object(map) = bad else { unreachable!() };
        assert!(matches!(Arch::Custom(map).resolve(), Err(Error::Config(_))));
    }

    #[test]
    fn tiny_channels_double_at_group_boundaries() {
        let layout = ConformerConfig::new(Arch::preset("tiny")).layout().unwrap();
        assert_eq!(layout.stage_1_channels, 64);
        assert_eq!(layout.stages.len(), 11);

        let by_index = |i: usize| layout.stages.iter().find(|s| s.index == i).unwrap();
        assert_eq!(by_index(4).out_channels, 64);
        assert_eq!(by_index(5).out_channels, 128);
        assert_eq!(by_index(5).stride, 2);
        assert!(by_index(5).res_conv);
        assert_eq!(by_index(6).in_channels, 128);
        assert_eq!(by_index(9).out_channels, 256);
        assert_eq!(by_index(9).in_channels, 128);
        assert_eq!(layout.final_channels(), 256);
    }

    #[test]
    fn small_and_base_widths() {
        for (name, stage_1, last, embed) in [("small", 256, 1024, 384), ("base", 384, 1536, 576)] {
            let layout = ConformerConfig::new(Arch::preset(name)).layout().unwrap();
            assert_eq!(layout.stage_1_channels, stage_1, "{name}");
            assert_eq!(layout.final_channels(), last, "{name}");
            assert_eq!(layout.arch.embed_dims, embed, "{name}");
            let widths: Vec<usize> = [4, 8, 12]
                .iter()
                .map(|&i| layout.stages.iter().find(|s| s.index == i).unwrap().out_channels)
                .collect();
            assert_eq!(widths, vec![stage_1, stage_1 * 2, stage_1 * 4], "{name}");
        }
    }

    #[test]
    fn dw_strides_follow_patch_size() {
        let layout = ConformerConfig::default().layout().unwrap();
        assert_eq!(layout.trans_dw_stride, 4);
        let strides: Vec<usize> = layout.stages.iter().map(|s| s.dw_stride).collect();
        assert_eq!(strides, vec![4, 4, 4, 2, 2, 2, 2, 1, 1, 1, 1]);
        assert_eq!(layout.num_patches(224, 224), 196);
    }

    #[test]
    fn only_the_last_stage_is_last_fusion() {
        let layout = ConformerConfig::default().layout().unwrap();
        let fused: Vec<usize> = layout
            .stages
            .iter()
            .filter(|s| s.last_fusion)
            .map(|s| s.index)
            .collect();
        assert_eq!(fused, vec![12]);
    }

    #[test]
    fn drop_path_schedule_is_monotone_from_zero_to_rate() {
        let rates = drop_path_schedule(0.1, 12);
        assert_eq!(rates.len(), 12);
        assert_eq!(rates[0], 0.0);
        assert_eq!(rates[11], 0.1);
        assert!(rates.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stages_use_shifted_drop_path_entries() {
        let cfg = ConformerConfig {
            drop_path_rate: 0.2,
            ..Default::default()
        };
        let layout = cfg.layout().unwrap();
        for stage in &layout.stages {
            assert_eq!(stage.drop_path_rate, layout.drop_path_rates[stage.index - 1]);
        }
        assert_eq!(layout.stages.last().unwrap().drop_path_rate, 0.2);
    }

    #[test]
    fn invalid_settings_fail_before_construction() {
        let bad_patch = ConformerConfig {
            patch_size: 8,
            ..Default::default()
        };
        assert!(matches!(bad_patch.layout(), Err(Error::Config(_))));

        let bad_index = ConformerConfig {
            out_indices: vec![1],
            ..Default::default()
        };
        assert!(matches!(bad_index.layout(), Err(Error::Config(_))));

        let bad_rate = ConformerConfig {
            drop_path_rate: 1.0,
            ..Default::default()
        };
        assert!(matches!(bad_rate.layout(), Err(Error::Config(_))));

        let bad_depths = ConformerConfig::new(ArchSettings {
            depths: 7,
            ..ArchSettings::TINY
        });
        assert!(matches!(bad_depths.layout(), Err(Error::Config(_))));
    }

    #[test]
    fn med_blocks_are_unsupported() {
        let cfg = ConformerConfig {
            stage_cfgs: StageCfgs {
                num_med_block: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(cfg.layout(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn config_deserializes_from_json() {
        let cfg: ConformerConfig = serde_json::from_value(json!({
            "arch": "small",
            "drop_path_rate": 0.1,
            "out_indices": [4, 8, 12],
            "init_cfg": {"type": "Pretrained", "checkpoint": "weights.safetensors"}
        }))
        .unwrap();
        assert_eq!(cfg.arch, Arch::preset("small"));
        assert_eq!(cfg.out_indices, vec![4, 8, 12]);
        assert_eq!(
            cfg.init_cfg,
            Some(InitCfg::Pretrained {
                checkpoint: PathBuf::from("weights.safetensors"),
                prefix: None,
            })
        );

        let custom: ConformerConfig = serde_json::from_value(json!({
            "arch": {"embed_dims": 96, "channel_ratio": 1, "num_heads": 4, "depths": 6}
        }))
        .unwrap();
        assert_eq!(custom.arch.resolve().unwrap().embed_dims, 96);
    }

    #[test]
    fn unknown_config_fields_are_rejected() {
        let result: std::result::Result<ConformerConfig, _> =
            serde_json::from_value(json!({"arch": "tiny", "num_classes": 1000}));
        assert!(result.is_err());
    }
}
