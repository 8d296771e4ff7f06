//! Model hyperparameters and the stage layout derived from them.
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ImagePrecision;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file")]
    ConfigFileError(#[from] std::io::Error),
    #[error("Config is not valid JSON")]
    ConfigFormatError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Hyperparameters of [`CnnAttnVae`](crate::CnnAttnVae). Missing fields take
/// their defaults, unknown fields (such as training-only drop rates) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Size of the transformer patches, relative to the input image.
    pub patch_size: usize,
    /// Channels of one branch image.
    pub in_chans: usize,
    /// Dimension of the latent space.
    pub decode_embed: usize,
    pub base_channel: usize,
    pub channel_ratio: usize,
    /// Extra residual blocks in every stage.
    pub num_med_block: usize,
    pub embed_dim: usize,
    /// Number of stages. Split into three equally long groups.
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    /// Overrides the attention scale `head_dim^-0.5`.
    pub qk_scale: Option<ImagePrecision>,
    pub im_size: usize,
    /// Nearest neighbour upsampling applied to the decoder seed.
    pub first_up: usize,
    pub num_branch: usize,
    /// Whether the encoder predicts a log-variance next to the mean.
    pub use_vae: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            patch_size: 16,
            in_chans: 3,
            decode_embed: 384,
            base_channel: 64,
            channel_ratio: 4,
            num_med_block: 0,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4.0,
            qkv_bias: false,
            qk_scale: None,
            im_size: 224,
            first_up: 2,
            num_branch: 4,
            use_vae: true,
        }
    }
}

/// Shape of one convolutional stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLayout {
    /// Position of the stage, used in the parameter names (`conv_trans_{index}`).
    pub index: usize,
    pub inplanes: usize,
    pub outplanes: usize,
    pub stride: usize,
    pub res_conv: bool,
    /// Ratio between the stage's feature map and the token grid.
    /// Always 1 for decoder stages, which have no tokens.
    pub dw_stride: usize,
    /// The fusion block of the last stage changes the resolution once more.
    pub last_fusion: bool,
}

impl ModelConfig {
    pub fn from_json_str(raw: &str) -> ConfigResult<ModelConfig> {
        let config: ModelConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<ModelConfig> {
        let raw = std::fs::read_to_string(path)?;
        ModelConfig::from_json_str(&raw)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfig(msg));
        if self.num_branch == 0 {
            return invalid("num_branch must be positive".into());
        }
        if self.in_chans == 0 {
            return invalid("in_chans must be positive".into());
        }
        if self.depth % 3 != 0 || self.depth < 6 {
            return invalid(format!(
                "depth must be a multiple of 3 and at least 6, got {}",
                self.depth
            ));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return invalid(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            ));
        }
        if self.patch_size == 0 || self.patch_size % 16 != 0 {
            return invalid(format!(
                "patch_size must be a multiple of 16, got {}",
                self.patch_size
            ));
        }
        if self.im_size == 0 || self.im_size % self.patch_size != 0 {
            return invalid(format!(
                "im_size {} is not divisible by patch_size {}",
                self.im_size, self.patch_size
            ));
        }
        if self.first_up == 0 || self.im_size % (16 * self.first_up) != 0 {
            return invalid(format!(
                "im_size {} is not divisible by 16 * first_up ({})",
                self.im_size, self.first_up
            ));
        }
        if self.base_channel * self.channel_ratio <= 4 {
            return invalid("base_channel * channel_ratio must exceed 4".into());
        }
        if self.decode_embed == 0 {
            return invalid("decode_embed must be positive".into());
        }
        if self.mlp_hidden_dim() == 0 {
            return invalid(format!("mlp_ratio {} leaves no hidden units", self.mlp_ratio));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// `qk_scale`, or `head_dim^-0.5` when it is unset or zero.
    pub fn attention_scale(&self) -> ImagePrecision {
        match self.qk_scale {
            Some(scale) if scale != 0.0 => scale,
            _ => (self.head_dim() as ImagePrecision).powf(-0.5),
        }
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    pub fn tokens_per_branch(&self) -> usize {
        (self.im_size / self.patch_size).pow(2)
    }

    /// Branch tokens plus the class token.
    pub fn num_tokens(&self) -> usize {
        self.num_branch * self.tokens_per_branch() + 1
    }

    /// Side length of the map the decoder reshapes its latent into.
    pub fn decoder_seed_size(&self) -> usize {
        self.im_size / (16 * self.first_up)
    }

    /// Per-branch width of the first convolution stage.
    pub fn stage_channels(&self) -> usize {
        self.base_channel * self.channel_ratio
    }

    /// Stages `2..=depth` of the encoder, in three groups of widths
    /// `c`, `2c` and `4c` (per branch). The first group is one stage shorter
    /// since stage 1 is built separately.
    pub fn encoder_stages(&self) -> Vec<StageLayout> {
        let c = self.stage_channels();
        let per_group = self.depth / 3;
        let groups = [
            (c, self.patch_size / 4),
            (2 * c, self.patch_size / 8),
            (4 * c, self.patch_size / 16),
        ];

        let mut stages = Vec::with_capacity(self.depth - 1);
        let mut index = 2;
        let mut inplanes = c;
        for (g, &(width, dw_stride)) in groups.iter().enumerate() {
            let end = (g + 1) * per_group + 1;
            for i in index..end {
                let first = i == index;
                stages.push(StageLayout {
                    index: i,
                    inplanes: if first { inplanes } else { width },
                    outplanes: width,
                    stride: if first { 2 } else { 1 },
                    res_conv: first,
                    dw_stride,
                    last_fusion: i == self.depth,
                });
            }
            index = end;
            inplanes = width;
        }
        stages
    }

    /// Stages `0..depth` of a decoder, in three groups of widths `4c`, `2c` and
    /// `c`. The very last stage halves its width and upsamples once more.
    pub fn decoder_stages(&self) -> Vec<StageLayout> {
        let c = self.stage_channels();
        let per_group = self.depth / 3;
        let widths = [4 * c, 2 * c, c];

        let mut stages = Vec::with_capacity(self.depth);
        let mut inplanes = 4 * c;
        for (g, &width) in widths.iter().enumerate() {
            for j in 0..per_group {
                let index = g * per_group + j;
                let first = j == 0;
                let last_fusion = index == self.depth - 1;
                stages.push(StageLayout {
                    index,
                    inplanes: if first { inplanes } else { width },
                    outplanes: if last_fusion { width / 2 } else { width },
                    stride: if first { 2 } else { 1 },
                    res_conv: first || last_fusion,
                    dw_stride: 1,
                    last_fusion,
                });
            }
            inplanes = width;
        }
        stages
    }

    /// Channels leaving the last decoder stage.
    pub fn decoder_out_planes(&self) -> usize {
        self.stage_channels() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_derived_quantities() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 64);
        assert!((config.attention_scale() - 0.125).abs() < 1e-7);
        assert_eq!(config.mlp_hidden_dim(), 3072);
        assert_eq!(config.tokens_per_branch(), 196);
        assert_eq!(config.num_tokens(), 785);
        assert_eq!(config.decoder_seed_size(), 7);
        assert_eq!(config.decoder_out_planes(), 128);
    }

    #[test]
    fn test_encoder_stage_layout() {
        let stages = ModelConfig::default().encoder_stages();
        assert_eq!(stages.len(), 11);
        assert_eq!(stages[0].index, 2);
        assert_eq!(stages.last().map(|s| s.index), Some(12));

        let firsts: Vec<_> = stages.iter().filter(|s| s.res_conv).map(|s| s.index).collect();
        assert_eq!(firsts, vec![2, 5, 9]);
        assert!(stages.iter().all(|s| s.res_conv == (s.stride == 2)));

        // group boundaries
        assert_eq!((stages[3].index, stages[3].inplanes, stages[3].outplanes), (5, 256, 512));
        assert_eq!(stages[3].dw_stride, 2);
        assert_eq!((stages[7].index, stages[7].inplanes, stages[7].outplanes), (9, 512, 1024));
        assert_eq!(stages[7].dw_stride, 1);
        assert_eq!(stages[0].dw_stride, 4);

        let fusing: Vec<_> = stages.iter().filter(|s| s.last_fusion).map(|s| s.index).collect();
        assert_eq!(fusing, vec![12]);
    }

    #[test]
    fn test_decoder_stage_layout() {
        let stages = ModelConfig::default().decoder_stages();
        assert_eq!(stages.len(), 12);
        let indices: Vec<_> = stages.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());

        assert_eq!((stages[0].inplanes, stages[0].outplanes, stages[0].stride), (1024, 1024, 2));
        assert_eq!((stages[4].inplanes, stages[4].outplanes, stages[4].stride), (1024, 512, 2));
        assert_eq!((stages[8].inplanes, stages[8].outplanes, stages[8].stride), (512, 256, 2));

        let last = stages[11];
        assert_eq!((last.inplanes, last.outplanes, last.stride), (256, 128, 1));
        assert!(last.res_conv && last.last_fusion);
        assert!(!stages[10].res_conv);
    }

    #[test]
    fn test_partial_json_with_unknown_fields() {
        let config = ModelConfig::from_json_str(
            r#"{"depth": 6, "num_branch": 2, "drop_path_rate": 0.1, "qk_scale": 0.5}"#,
        )
        .unwrap();
        assert_eq!(config.depth, 6);
        assert_eq!(config.num_branch, 2);
        assert_eq!(config.embed_dim, 768);
        assert_eq!(config.attention_scale(), 0.5);
        assert_eq!(config.encoder_stages().len(), 5);
    }

    #[test]
    fn test_zero_qk_scale_falls_back_to_head_dim() {
        let config = ModelConfig::from_json_str(r#"{"qk_scale": 0.0}"#).unwrap();
        // 768 / 12 heads
        assert!((config.attention_scale() - 0.125).abs() < 1e-7);
        let config = ModelConfig::from_json_str(r#"{"qk_scale": null}"#).unwrap();
        assert!((config.attention_scale() - 0.125).abs() < 1e-7);
    }

    #[test]
    fn test_invalid_configs() {
        let cases = vec![
            r#"{"depth": 7}"#,
            r#"{"depth": 3}"#,
            r#"{"num_heads": 5}"#,
            r#"{"patch_size": 8}"#,
            r#"{"im_size": 200}"#,
            r#"{"im_size": 32, "patch_size": 32, "first_up": 4}"#,
            r#"{"num_branch": 0}"#,
            r#"{"base_channel": 1, "channel_ratio": 4}"#,
            r#"{"mlp_ratio": 0.0}"#,
        ];
        for raw in cases {
            match ModelConfig::from_json_str(raw) {
                Err(ConfigError::InvalidConfig(_)) => {}
                other => panic!("{} was accepted: {:?}", raw, other),
            }
        }
        assert!(matches!(
            ModelConfig::from_json_str("{depth: 6"),
            Err(ConfigError::ConfigFormatError(_))
        ));
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"im_size": 64, "patch_size": 32}"#).unwrap();
        let config = ModelConfig::from_json_file(&path).unwrap();
        assert_eq!(config.tokens_per_branch(), 4);
        assert!(matches!(
            ModelConfig::from_json_file(dir.path().join("missing.json")),
            Err(ConfigError::ConfigFileError(_))
        ));
    }
}
