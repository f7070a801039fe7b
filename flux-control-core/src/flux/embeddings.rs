//! Timestep, guidance, pooled-text and rotary position embeddings shared by the
//! Flux transformer and the Flux ControlNet.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::TransformerConfig;

/// Width of the sinusoidal projection fed into the timestep and guidance MLPs.
pub const TIME_PROJ_DIM: usize = 256;

/// Sinusoidal embedding of `t` in [0, 1] (scaled by 1000), laid out as `[cos, sin]`.
pub fn timestep_embedding(t: &Tensor, dim: usize, dtype: DType) -> Result<Tensor> {
    const TIME_FACTOR: f64 = 1000.;
    const MAX_PERIOD: f64 = 10000.;
    if dim % 2 == 1 {
        candle_core::bail!("{dim} is odd")
    }
    let dev = t.device();
    let half = dim / 2;
    let t = (t.to_dtype(DType::F32)? * TIME_FACTOR)?;
    let arange = Tensor::arange(0, half as u32, dev)?.to_dtype(DType::F32)?;
    let freqs = (arange * (-MAX_PERIOD.ln() / half as f64))?.exp()?;
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?;
    emb.to_dtype(dtype)
}

/// Two layer MLP with a SiLU in between (`linear_1`, `linear_2`).
#[derive(Debug, Clone)]
pub struct MlpEmbedder {
    linear_1: Linear,
    linear_2: Linear,
}

impl MlpEmbedder {
    pub fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = candle_nn::linear(in_sz, h_sz, vb.pp("linear_1"))?;
        let linear_2 = candle_nn::linear(h_sz, h_sz, vb.pp("linear_2"))?;
        Ok(Self { linear_1, linear_2 })
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.linear_1)?.silu()?.apply(&self.linear_2)
    }
}

/// Conditioning vector: timestep + guidance + pooled CLIP embedding.
#[derive(Debug, Clone)]
pub struct TimeTextEmbedding {
    timestep_embedder: MlpEmbedder,
    guidance_embedder: Option<MlpEmbedder>,
    text_embedder: MlpEmbedder,
}

impl TimeTextEmbedding {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let inner_dim = cfg.inner_dim();
        let timestep_embedder =
            MlpEmbedder::new(TIME_PROJ_DIM, inner_dim, vb.pp("timestep_embedder"))?;
        let guidance_embedder = if cfg.guidance_embeds {
            Some(MlpEmbedder::new(
                TIME_PROJ_DIM,
                inner_dim,
                vb.pp("guidance_embedder"),
            )?)
        } else {
            None
        };
        let text_embedder =
            MlpEmbedder::new(cfg.pooled_projection_dim, inner_dim, vb.pp("text_embedder"))?;
        Ok(Self {
            timestep_embedder,
            guidance_embedder,
            text_embedder,
        })
    }

    pub fn forward(
        &self,
        timesteps: &Tensor,
        guidance: Option<&Tensor>,
        pooled: &Tensor,
    ) -> Result<Tensor> {
        let dtype = pooled.dtype();
        let mut temb = timestep_embedding(timesteps, TIME_PROJ_DIM, dtype)?
            .apply(&self.timestep_embedder)?;
        if let Some(embedder) = &self.guidance_embedder {
            let Some(guidance) = guidance else {
                candle_core::bail!("this model embeds guidance but none was provided")
            };
            let gemb = timestep_embedding(guidance, TIME_PROJ_DIM, dtype)?.apply(embedder)?;
            temb = (temb + gemb)?;
        }
        temb + pooled.apply(&self.text_embedder)?
    }
}

/// Cosine and sine tables of shape (batch, 1, seq, head_dim), f32.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    pub cos: Tensor,
    pub sin: Tensor,
}

/// Multi-axis rotary position embedding over (batch, seq, n_axes) position ids.
#[derive(Debug, Clone)]
pub struct PosEmbed {
    theta: f64,
    axes_dim: Vec<usize>,
}

impl PosEmbed {
    pub fn new(theta: f64, axes_dim: Vec<usize>) -> Self {
        Self { theta, axes_dim }
    }

    pub fn forward(&self, ids: &Tensor) -> Result<RotaryEmbedding> {
        let n_axes = ids.dim(D::Minus1)?;
        if n_axes != self.axes_dim.len() {
            candle_core::bail!(
                "position ids have {n_axes} axes, expected {}",
                self.axes_dim.len()
            )
        }
        let ids = ids.to_dtype(DType::F32)?;
        let mut cos = Vec::with_capacity(n_axes);
        let mut sin = Vec::with_capacity(n_axes);
        for (idx, &dim) in self.axes_dim.iter().enumerate() {
            let pos = ids.narrow(D::Minus1, idx, 1)?;
            let inv_freq: Vec<f32> = (0..dim)
                .step_by(2)
                .map(|i| 1. / self.theta.powf(i as f64 / dim as f64) as f32)
                .collect();
            let n_freq = inv_freq.len();
            let inv_freq = Tensor::from_vec(inv_freq, (1, 1, n_freq), ids.device())?;
            let freqs = pos.broadcast_mul(&inv_freq)?;
            // every frequency covers one (real, imaginary) pair
            let freqs = Tensor::stack(&[&freqs, &freqs], 3)?.flatten_from(2)?;
            cos.push(freqs.cos()?);
            sin.push(freqs.sin()?);
        }
        Ok(RotaryEmbedding {
            cos: Tensor::cat(&cos, D::Minus1)?.unsqueeze(1)?,
            sin: Tensor::cat(&sin, D::Minus1)?.unsqueeze(1)?,
        })
    }
}

/// Rotates interleaved pairs of `xs` (batch, heads, seq, head_dim).
pub fn apply_rope(xs: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
    let dtype = xs.dtype();
    let (b_sz, n_head, seq_len, head_dim) = xs.dims4()?;
    let xs = xs.to_dtype(DType::F32)?;
    let pairs = xs.reshape((b_sz, n_head, seq_len, head_dim / 2, 2))?;
    let real = pairs.narrow(4, 0, 1)?;
    let imag = pairs.narrow(4, 1, 1)?;
    let rotated = Tensor::cat(&[&imag.neg()?, &real], 4)?.reshape((b_sz, n_head, seq_len, head_dim))?;
    let out = (xs.broadcast_mul(&rope.cos)? + rotated.broadcast_mul(&rope.sin)?)?;
    out.to_dtype(dtype)
}
