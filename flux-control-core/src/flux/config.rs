use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_in_channels() -> usize {
    64
}

fn default_attention_head_dim() -> usize {
    128
}

fn default_num_attention_heads() -> usize {
    24
}

fn default_joint_attention_dim() -> usize {
    4096
}

fn default_pooled_projection_dim() -> usize {
    768
}

fn default_axes_dims_rope() -> Vec<usize> {
    vec![16, 56, 56]
}

/// Shape of a Flux transformer or Flux ControlNet, as stored in the diffusers
/// `config.json` next to the weights.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub num_layers: usize,
    pub num_single_layers: usize,
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_joint_attention_dim")]
    pub joint_attention_dim: usize,
    #[serde(default = "default_pooled_projection_dim")]
    pub pooled_projection_dim: usize,
    #[serde(default)]
    pub guidance_embeds: bool,
    #[serde(default = "default_axes_dims_rope")]
    pub axes_dims_rope: Vec<usize>,
    /// Number of control modes of a union ControlNet; absent for plain ControlNets.
    #[serde(default)]
    pub num_mode: Option<usize>,
}

impl TransformerConfig {
    /// FLUX.1-dev transformer.
    pub fn dev() -> Self {
        Self {
            in_channels: 64,
            num_layers: 19,
            num_single_layers: 38,
            attention_head_dim: 128,
            num_attention_heads: 24,
            joint_attention_dim: 4096,
            pooled_projection_dim: 768,
            guidance_embeds: true,
            axes_dims_rope: default_axes_dims_rope(),
            num_mode: None,
        }
    }

    /// FLUX.1-dev ControlNet Union Pro.
    pub fn union_pro() -> Self {
        Self {
            num_layers: 5,
            num_single_layers: 10,
            num_mode: Some(10),
            ..Self::dev()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn inner_dim(&self) -> usize {
        self.num_attention_heads * self.attention_head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_diffusers_controlnet_config() {
        let raw = r#"{
            "_class_name": "FluxControlNetModel",
            "_diffusers_version": "0.30.0.dev0",
            "attention_head_dim": 128,
            "axes_dims_rope": [16, 56, 56],
            "guidance_embeds": true,
            "in_channels": 64,
            "joint_attention_dim": 4096,
            "num_attention_heads": 24,
            "num_layers": 5,
            "num_mode": 10,
            "num_single_layers": 10,
            "patch_size": 1,
            "pooled_projection_dim": 768
        }"#;
        let cfg: TransformerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg, TransformerConfig::union_pro());
        assert_eq!(cfg.inner_dim(), 3072);
    }

    #[test]
    fn missing_fields_take_flux_defaults() {
        let cfg: TransformerConfig =
            serde_json::from_str(r#"{"num_layers": 19, "num_single_layers": 38, "guidance_embeds": true}"#)
                .unwrap();
        assert_eq!(cfg, TransformerConfig::dev());
    }
}
