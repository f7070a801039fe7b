//! Flux ControlNet (including the union variant with a control-mode embedding)
//! and the multi-condition aggregate that sums the residuals of every condition.

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use super::blocks::{DoubleStreamBlock, SingleStreamBlock};
use super::config::TransformerConfig;
use super::embeddings::{PosEmbed, TimeTextEmbedding};
use super::transformer::ROPE_THETA;

/// Residuals added to the image tokens of the transformer after its
/// double-stream and single-stream blocks.
#[derive(Debug, Clone)]
pub struct ControlResiduals {
    pub double: Vec<Tensor>,
    pub single: Vec<Tensor>,
}

impl ControlResiduals {
    /// Element-wise sum of two residual sets of the same layout.
    pub fn accumulate(self, other: &ControlResiduals) -> Result<Self> {
        fn add(lhs: Vec<Tensor>, rhs: &[Tensor]) -> Result<Vec<Tensor>> {
            if lhs.len() != rhs.len() {
                candle_core::bail!("cannot sum {} residuals with {}", lhs.len(), rhs.len())
            }
            lhs.into_iter().zip(rhs).map(|(l, r)| l + r).collect()
        }
        Ok(Self {
            double: add(self.double, &other.double)?,
            single: add(self.single, &other.single)?,
        })
    }
}

/// Packed VAE latents of one control image with its mode code and strength.
#[derive(Debug, Clone)]
pub struct ControlLatents {
    pub latents: Tensor,
    pub mode: u32,
    pub scale: f64,
}

#[derive(Debug, Clone)]
pub struct FluxControlNet {
    x_embedder: Linear,
    controlnet_x_embedder: Linear,
    context_embedder: Linear,
    time_text_embed: TimeTextEmbedding,
    mode_embedder: Option<Embedding>,
    pos_embed: PosEmbed,
    transformer_blocks: Vec<DoubleStreamBlock>,
    single_transformer_blocks: Vec<SingleStreamBlock>,
    controlnet_blocks: Vec<Linear>,
    controlnet_single_blocks: Vec<Linear>,
}

impl FluxControlNet {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.inner_dim();
        let (heads, head_dim) = (cfg.num_attention_heads, cfg.attention_head_dim);
        let mode_embedder = match cfg.num_mode {
            Some(num_mode) => Some(candle_nn::embedding(
                num_mode,
                dim,
                vb.pp("controlnet_mode_embedder"),
            )?),
            None => None,
        };
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
        let controlnet_blocks = (0..cfg.num_layers)
            .map(|idx| candle_nn::linear(dim, dim, vb.pp("controlnet_blocks").pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        let controlnet_single_blocks = (0..cfg.num_single_layers)
            .map(|idx| candle_nn::linear(dim, dim, vb.pp("controlnet_single_blocks").pp(idx)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            x_embedder: candle_nn::linear(cfg.in_channels, dim, vb.pp("x_embedder"))?,
            controlnet_x_embedder: candle_nn::linear(
                cfg.in_channels,
                dim,
                vb.pp("controlnet_x_embedder"),
            )?,
            context_embedder: candle_nn::linear(
                cfg.joint_attention_dim,
                dim,
                vb.pp("context_embedder"),
            )?,
            time_text_embed: TimeTextEmbedding::new(cfg, vb.pp("time_text_embed"))?,
            mode_embedder,
            pos_embed: PosEmbed::new(ROPE_THETA, cfg.axes_dims_rope.clone()),
            transformer_blocks,
            single_transformer_blocks,
            controlnet_blocks,
            controlnet_single_blocks,
        })
    }

    pub fn is_union(&self) -> bool {
        self.mode_embedder.is_some()
    }

    /// Runs the ControlNet for one condition and returns its residuals scaled
    /// by the condition strength.
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
        control: &ControlLatents,
    ) -> Result<ControlResiduals> {
        let temb = self.time_text_embed.forward(timesteps, guidance, y)?;
        let mut img = (img.apply(&self.x_embedder)?
            + control.latents.apply(&self.controlnet_x_embedder)?)?;
        let mut txt = txt.apply(&self.context_embedder)?;

        // union nets prepend a mode token to the text stream
        let txt_ids = match &self.mode_embedder {
            Some(embedder) => {
                let (b_sz, _, dim) = txt.dims3()?;
                let mode = Tensor::new(&[control.mode], txt.device())?.unsqueeze(0)?;
                let mode_emb = embedder
                    .forward(&mode)?
                    .to_dtype(txt.dtype())?
                    .broadcast_as((b_sz, 1, dim))?
                    .contiguous()?;
                txt = Tensor::cat(&[&mode_emb, &txt], 1)?;
                Tensor::cat(&[&txt_ids.narrow(1, 0, 1)?, txt_ids], 1)?
            }
            None => txt_ids.clone(),
        };
        let pe = self
            .pos_embed
            .forward(&Tensor::cat(&[&txt_ids, img_ids], 1)?)?;

        let mut double = Vec::with_capacity(self.transformer_blocks.len());
        for (block, proj) in self.transformer_blocks.iter().zip(&self.controlnet_blocks) {
            (txt, img) = block.forward(&img, &txt, &temb, &pe)?;
            double.push((img.apply(proj)? * control.scale)?);
        }

        let txt_len = txt.dim(1)?;
        let img_len = img.dim(1)?;
        let mut merged = Tensor::cat(&[&txt, &img], 1)?;
        let mut single = Vec::with_capacity(self.single_transformer_blocks.len());
        for (block, proj) in self
            .single_transformer_blocks
            .iter()
            .zip(&self.controlnet_single_blocks)
        {
            merged = block.forward(&merged, &temb, &pe)?;
            let img = merged.narrow(1, txt_len, img_len)?;
            single.push((img.apply(proj)? * control.scale)?);
        }

        Ok(ControlResiduals { double, single })
    }
}

/// One or more ControlNets driven by an ordered list of conditions.
///
/// A single union net is run once per condition; several nets are paired with
/// the conditions in order. Residuals of all runs are summed.
#[derive(Debug, Clone)]
pub struct MultiControlNet {
    nets: Vec<FluxControlNet>,
}

impl MultiControlNet {
    pub fn new(nets: Vec<FluxControlNet>) -> Result<Self> {
        if nets.is_empty() {
            candle_core::bail!("at least one ControlNet is required")
        }
        Ok(Self { nets })
    }

    fn pairs<'a>(
        &'a self,
        controls: &'a [ControlLatents],
    ) -> Box<dyn Iterator<Item = (&'a FluxControlNet, &'a ControlLatents)> + 'a> {
        match self.nets.as_slice() {
            [net] if net.is_union() => Box::new(controls.iter().map(move |c| (net, c))),
            nets => Box::new(nets.iter().zip(controls)),
        }
    }

    /// Returns `None` when there is no condition to apply.
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
        controls: &[ControlLatents],
    ) -> Result<Option<ControlResiduals>> {
        let mut total: Option<ControlResiduals> = None;
        for (net, control) in self.pairs(controls) {
            let residuals =
                net.forward(img, img_ids, txt, txt_ids, timesteps, y, guidance, control)?;
            total = Some(match total {
                Some(total) => total.accumulate(&residuals)?,
                None => residuals,
            });
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flux::transformer::tests::tiny_config;
    use candle_core::{DType, Device};

    fn union_config() -> TransformerConfig {
        TransformerConfig {
            num_layers: 2,
            num_single_layers: 3,
            num_mode: Some(10),
            ..tiny_config()
        }
    }

    struct Inputs {
        img: Tensor,
        img_ids: Tensor,
        txt: Tensor,
        txt_ids: Tensor,
        t: Tensor,
        y: Tensor,
        g: Tensor,
    }

    fn inputs(dev: &Device) -> Result<Inputs> {
        Ok(Inputs {
            img: Tensor::randn(0f32, 1., (1, 4, 8), dev)?,
            img_ids: Tensor::zeros((1, 4, 3), DType::F32, dev)?,
            txt: Tensor::randn(0f32, 1., (1, 5, 12), dev)?,
            txt_ids: Tensor::zeros((1, 5, 3), DType::F32, dev)?,
            t: Tensor::new(&[1f32], dev)?,
            y: Tensor::randn(0f32, 1., (1, 6), dev)?,
            g: Tensor::new(&[3.5f32], dev)?,
        })
    }

    fn control(dev: &Device, mode: u32, scale: f64) -> Result<ControlLatents> {
        Ok(ControlLatents {
            latents: Tensor::randn(0f32, 1., (1, 4, 8), dev)?,
            mode,
            scale,
        })
    }

    #[test]
    fn zero_net_yields_one_zero_residual_per_block() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = union_config();
        let net = FluxControlNet::new(&cfg, VarBuilder::zeros(DType::F32, &dev))?;
        assert!(net.is_union());
        let i = inputs(&dev)?;
        let res = net.forward(
            &i.img,
            &i.img_ids,
            &i.txt,
            &i.txt_ids,
            &i.t,
            &i.y,
            Some(&i.g),
            &control(&dev, 2, 0.5)?,
        )?;
        assert_eq!(res.double.len(), cfg.num_layers);
        assert_eq!(res.single.len(), cfg.num_single_layers);
        for residual in res.double.iter().chain(res.single.iter()) {
            assert_eq!(residual.dims(), &[1, 4, 16]);
            let max = residual.abs()?.max_all()?.to_scalar::<f32>()?;
            assert_eq!(max, 0.);
        }
        Ok(())
    }

    #[test]
    fn residuals_accumulate() -> Result<()> {
        let dev = Device::Cpu;
        let ones = Tensor::ones((1, 2, 4), DType::F32, &dev)?;
        let a = ControlResiduals {
            double: vec![ones.clone()],
            single: vec![ones.clone(), ones.clone()],
        };
        let b = ControlResiduals {
            double: vec![(&ones * 2.)?],
            single: vec![ones.clone(), (&ones * 3.)?],
        };
        let sum = a.accumulate(&b)?;
        assert_eq!(sum.double[0].flatten_all()?.to_vec1::<f32>()?, vec![3.; 8]);
        assert_eq!(sum.single[1].flatten_all()?.to_vec1::<f32>()?, vec![4.; 8]);

        let short = ControlResiduals {
            double: vec![],
            single: vec![],
        };
        assert!(sum.accumulate(&short).is_err());
        Ok(())
    }

    #[test]
    fn multi_net_pairs_conditions() -> Result<()> {
        let dev = Device::Cpu;
        let union = FluxControlNet::new(&union_config(), VarBuilder::zeros(DType::F32, &dev))?;
        let multi = MultiControlNet::new(vec![union.clone()])?;
        let controls = [control(&dev, 0, 0.2)?, control(&dev, 2, 0.6)?];
        assert_eq!(multi.pairs(&controls).count(), 2);

        let plain_cfg = TransformerConfig {
            num_mode: None,
            ..union_config()
        };
        let plain = FluxControlNet::new(&plain_cfg, VarBuilder::zeros(DType::F32, &dev))?;
        let multi_plain = MultiControlNet::new(vec![plain])?;
        assert_eq!(multi_plain.pairs(&controls).count(), 1);

        let i = inputs(&dev)?;
        let none = multi.forward(
            &i.img,
            &i.img_ids,
            &i.txt,
            &i.txt_ids,
            &i.t,
            &i.y,
            Some(&i.g),
            &[],
        )?;
        assert!(none.is_none());

        let summed = multi
            .forward(
                &i.img,
                &i.img_ids,
                &i.txt,
                &i.txt_ids,
                &i.t,
                &i.y,
                Some(&i.g),
                &controls,
            )?
            .unwrap();
        assert_eq!(summed.double.len(), 2);
        assert_eq!(summed.single.len(), 3);

        assert!(MultiControlNet::new(vec![]).is_err());
        Ok(())
    }
}
