use candle_core::{Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder};

use super::blocks::{layer_norm, DoubleStreamBlock, SingleStreamBlock};
use super::config::TransformerConfig;
use super::controlnet::ControlResiduals;
use super::embeddings::{PosEmbed, TimeTextEmbedding};

pub(crate) const ROPE_THETA: f64 = 10_000.;

/// Final adaptive norm: the conditioning vector yields `scale` then `shift`.
#[derive(Debug, Clone)]
struct AdaNormContinuous {
    norm: LayerNorm,
    linear: Linear,
}

impl AdaNormContinuous {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: layer_norm(dim, vb.device(), vb.dtype())?,
            linear: candle_nn::linear(dim, 2 * dim, vb.pp("linear"))?,
        })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let chunks = temb.silu()?.apply(&self.linear)?.chunk(2, D::Minus1)?;
        let (scale, shift) = (&chunks[0], &chunks[1]);
        xs.apply(&self.norm)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.)?)?
            .broadcast_add(&shift.unsqueeze(1)?)
    }
}

/// Index of the ControlNet residual applied after block `block_idx`, when
/// `n_residuals` residuals are spread evenly over `n_blocks` blocks.
pub fn residual_index(block_idx: usize, n_blocks: usize, n_residuals: usize) -> usize {
    let interval = n_blocks.div_ceil(n_residuals);
    block_idx / interval
}

/// FLUX.1 rectified-flow transformer that accepts ControlNet residuals.
#[derive(Debug, Clone)]
pub struct FluxTransformer {
    x_embedder: Linear,
    context_embedder: Linear,
    time_text_embed: TimeTextEmbedding,
    pos_embed: PosEmbed,
    transformer_blocks: Vec<DoubleStreamBlock>,
    single_transformer_blocks: Vec<SingleStreamBlock>,
    norm_out: AdaNormContinuous,
    proj_out: Linear,
}

impl FluxTransformer {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.inner_dim();
        let (heads, head_dim) = (cfg.num_attention_heads, cfg.attention_head_dim);
        let x_embedder = candle_nn::linear(cfg.in_channels, dim, vb.pp("x_embedder"))?;
        let context_embedder =
            candle_nn::linear(cfg.joint_attention_dim, dim, vb.pp("context_embedder"))?;
        let time_text_embed = TimeTextEmbedding::new(cfg, vb.pp("time_text_embed"))?;
        let transformer_blocks = (0..cfg.num_layers)
            .map(|idx| {
                DoubleStreamBlock::new(dim, heads, head_dim, vb.pp("transformer_blocks").pp(idx))
            })
            .collect::<Result<Vec<_>>>()?;
        let single_transformer_blocks = (0..cfg.num_single_layers)
            .map(|idx| {
                SingleStreamBlock::new(
                    dim,
                    heads,
                    head_dim,
                    vb.pp("single_transformer_blocks").pp(idx),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let norm_out = AdaNormContinuous::new(dim, vb.pp("norm_out"))?;
        let proj_out = candle_nn::linear(dim, cfg.in_channels, vb.pp("proj_out"))?;
        Ok(Self {
            x_embedder,
            context_embedder,
            time_text_embed,
            pos_embed: PosEmbed::new(ROPE_THETA, cfg.axes_dims_rope.clone()),
            transformer_blocks,
            single_transformer_blocks,
            norm_out,
            proj_out,
        })
    }

    /// Predicts the flow velocity for packed latents `img` (batch, seq, 64).
    ///
    /// `timesteps` is in [0, 1]; `guidance` is the raw distilled guidance scale.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        y: &Tensor,
        guidance: Option<&Tensor>,
        control: Option<&ControlResiduals>,
    ) -> Result<Tensor> {
        let temb = self.time_text_embed.forward(timesteps, guidance, y)?;
        let mut img = img.apply(&self.x_embedder)?;
        let mut txt = txt.apply(&self.context_embedder)?;
        let pe = self
            .pos_embed
            .forward(&Tensor::cat(&[txt_ids, img_ids], 1)?)?;

        let n_double = self.transformer_blocks.len();
        for (idx, block) in self.transformer_blocks.iter().enumerate() {
            (txt, img) = block.forward(&img, &txt, &temb, &pe)?;
            if let Some(residuals) = control.filter(|c| !c.double.is_empty()) {
                let residual = &residuals.double[residual_index(idx, n_double, residuals.double.len())];
                img = (img + residual)?;
            }
        }

        let txt_len = txt.dim(1)?;
        let img_len = img.dim(1)?;
        let mut merged = Tensor::cat(&[&txt, &img], 1)?;
        let n_single = self.single_transformer_blocks.len();
        for (idx, block) in self.single_transformer_blocks.iter().enumerate() {
            merged = block.forward(&merged, &temb, &pe)?;
            if let Some(residuals) = control.filter(|c| !c.single.is_empty()) {
                let residual = &residuals.single[residual_index(idx, n_single, residuals.single.len())];
                let txt_part = merged.narrow(1, 0, txt_len)?;
                let img_part = (merged.narrow(1, txt_len, img_len)? + residual)?;
                merged = Tensor::cat(&[&txt_part, &img_part], 1)?;
            }
        }

        let img = merged.narrow(1, txt_len, img_len)?;
        self.norm_out.forward(&img, &temb)?.apply(&self.proj_out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};

    pub(crate) fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            in_channels: 8,
            num_layers: 3,
            num_single_layers: 4,
            attention_head_dim: 8,
            num_attention_heads: 2,
            joint_attention_dim: 12,
            pooled_projection_dim: 6,
            guidance_embeds: true,
            axes_dims_rope: vec![2, 2, 4],
            num_mode: None,
        }
    }

    #[test]
    fn residual_intervals() {
        // 19 double blocks over 5 residuals -> interval 4
        let idx: Vec<usize> = (0..19).map(|i| residual_index(i, 19, 5)).collect();
        assert_eq!(idx[0], 0);
        assert_eq!(idx[3], 0);
        assert_eq!(idx[4], 1);
        assert_eq!(idx[18], 4);
        // 38 single blocks over 10 residuals -> interval 4
        assert_eq!(residual_index(37, 38, 10), 9);
        assert_eq!(residual_index(5, 10, 10), 5);
    }

    #[test]
    fn output_matches_packed_latent_shape() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let model = FluxTransformer::new(&cfg, VarBuilder::zeros(DType::F32, &dev))?;
        let img = Tensor::randn(0f32, 1., (1, 4, 8), &dev)?;
        let img_ids = Tensor::zeros((1, 4, 3), DType::F32, &dev)?;
        let txt = Tensor::randn(0f32, 1., (1, 5, 12), &dev)?;
        let txt_ids = Tensor::zeros((1, 5, 3), DType::F32, &dev)?;
        let t = Tensor::new(&[0.5f32], &dev)?;
        let y = Tensor::randn(0f32, 1., (1, 6), &dev)?;
        let g = Tensor::new(&[3.5f32], &dev)?;

        let out = model.forward(&img, &img_ids, &txt, &txt_ids, &t, &y, Some(&g), None)?;
        assert_eq!(out.dims(), &[1, 4, 8]);

        // guidance-distilled models refuse to run without guidance
        assert!(model
            .forward(&img, &img_ids, &txt, &txt_ids, &t, &y, None, None)
            .is_err());

        let residuals = ControlResiduals {
            double: vec![Tensor::ones((1, 4, 16), DType::F32, &dev)?],
            single: vec![Tensor::ones((1, 4, 16), DType::F32, &dev)?; 2],
        };
        let out = model.forward(
            &img,
            &img_ids,
            &txt,
            &txt_ids,
            &t,
            &y,
            Some(&g),
            Some(&residuals),
        )?;
        assert_eq!(out.dims(), &[1, 4, 8]);
        Ok(())
    }
}
