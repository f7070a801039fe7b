//! Double-stream (joint text/image) and single-stream Flux transformer blocks,
//! using the diffusers weight layout.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module, RmsNorm, VarBuilder};

use super::embeddings::{apply_rope, RotaryEmbedding};

const NORM_EPS: f64 = 1e-6;

/// LayerNorm without learned affine parameters; modulation supplies scale and shift.
pub(crate) fn layer_norm(dim: usize, device: &Device, dtype: DType) -> Result<LayerNorm> {
    let ws = Tensor::ones(dim, dtype, device)?;
    Ok(LayerNorm::new_no_bias(ws, NORM_EPS))
}

#[cfg(feature = "flash-attn")]
fn attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    // flash-attn wants (batch, seq, heads, head_dim)
    let scale = 1. / (q.dim(D::Minus1)? as f32).sqrt();
    let q = q.transpose(1, 2)?.contiguous()?;
    let k = k.transpose(1, 2)?.contiguous()?;
    let v = v.transpose(1, 2)?.contiguous()?;
    candle_flash_attn::flash_attn(&q, &k, &v, scale, false)?.transpose(1, 2)
}

#[cfg(not(feature = "flash-attn"))]
fn attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let scale = 1. / (q.dim(D::Minus1)? as f64).sqrt();
    let q = q.contiguous()?;
    let k = k.contiguous()?;
    let v = v.contiguous()?;
    let weights = (q.matmul(&k.t()?)? * scale)?;
    candle_nn::ops::softmax_last_dim(&weights)?.matmul(&v)
}

/// Shift, scale and gate produced by an adaptive norm, broadcast over the sequence.
#[derive(Debug, Clone)]
pub struct ModulationOut {
    pub shift: Tensor,
    pub scale: Tensor,
    pub gate: Tensor,
}

impl ModulationOut {
    pub fn scale_shift(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?
            .broadcast_add(&self.shift)
    }

    pub fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

/// SiLU + linear projection of the conditioning vector into `n` (batch, 1, dim) chunks.
#[derive(Debug, Clone)]
struct Modulation {
    linear: Linear,
    chunks: usize,
}

impl Modulation {
    fn new(dim: usize, chunks: usize, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(dim, chunks * dim, vb.pp("linear"))?;
        Ok(Self { linear, chunks })
    }

    fn forward(&self, temb: &Tensor) -> Result<Vec<Tensor>> {
        temb.silu()?
            .apply(&self.linear)?
            .unsqueeze(1)?
            .chunk(self.chunks, D::Minus1)
    }

    fn pair(&self, temb: &Tensor) -> Result<(ModulationOut, ModulationOut)> {
        let ys = self.forward(temb)?;
        if ys.len() != 6 {
            candle_core::bail!("expected 6 modulation chunks, got {}", ys.len())
        }
        let mod1 = ModulationOut {
            shift: ys[0].clone(),
            scale: ys[1].clone(),
            gate: ys[2].clone(),
        };
        let mod2 = ModulationOut {
            shift: ys[3].clone(),
            scale: ys[4].clone(),
            gate: ys[5].clone(),
        };
        Ok((mod1, mod2))
    }

    fn single(&self, temb: &Tensor) -> Result<ModulationOut> {
        let ys = self.forward(temb)?;
        if ys.len() != 3 {
            candle_core::bail!("expected 3 modulation chunks, got {}", ys.len())
        }
        Ok(ModulationOut {
            shift: ys[0].clone(),
            scale: ys[1].clone(),
            gate: ys[2].clone(),
        })
    }
}

/// GELU (tanh) feed-forward, `net.0.proj` -> `net.2`.
#[derive(Debug, Clone)]
struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let proj_in = candle_nn::linear(dim, dim * 4, vb.pp("net.0.proj"))?;
        let proj_out = candle_nn::linear(dim * 4, dim, vb.pp("net.2"))?;
        Ok(Self { proj_in, proj_out })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.proj_in)?.gelu()?.apply(&self.proj_out)
    }
}

/// Q/K/V projections with per-head RMS normalization of queries and keys.
#[derive(Debug, Clone)]
struct QkvProjection {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    norm_q: RmsNorm,
    norm_k: RmsNorm,
    num_heads: usize,
    head_dim: usize,
}

impl QkvProjection {
    fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        names: [&str; 5],
        vb: &VarBuilder,
    ) -> Result<Self> {
        let inner = num_heads * head_dim;
        Ok(Self {
            to_q: candle_nn::linear(dim, inner, vb.pp(names[0]))?,
            to_k: candle_nn::linear(dim, inner, vb.pp(names[1]))?,
            to_v: candle_nn::linear(dim, inner, vb.pp(names[2]))?,
            norm_q: candle_nn::rms_norm(head_dim, NORM_EPS, vb.pp(names[3]))?,
            norm_k: candle_nn::rms_norm(head_dim, NORM_EPS, vb.pp(names[4]))?,
            num_heads,
            head_dim,
        })
    }

    /// Returns q, k, v as (batch, heads, seq, head_dim).
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)
        };
        let q = split(xs.apply(&self.to_q)?)?.apply(&self.norm_q)?;
        let k = split(xs.apply(&self.to_k)?)?.apply(&self.norm_k)?;
        let v = split(xs.apply(&self.to_v)?)?;
        Ok((q, k, v))
    }
}

fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    xs.transpose(1, 2)?.flatten_from(2)
}

/// Joint attention over the concatenated [text, image] sequence.
#[derive(Debug, Clone)]
struct JointAttention {
    img: QkvProjection,
    txt: QkvProjection,
    to_out: Linear,
    to_add_out: Linear,
}

impl JointAttention {
    fn new(dim: usize, num_heads: usize, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        let img = QkvProjection::new(
            dim,
            num_heads,
            head_dim,
            ["to_q", "to_k", "to_v", "norm_q", "norm_k"],
            &vb,
        )?;
        let txt = QkvProjection::new(
            dim,
            num_heads,
            head_dim,
            [
                "add_q_proj",
                "add_k_proj",
                "add_v_proj",
                "norm_added_q",
                "norm_added_k",
            ],
            &vb,
        )?;
        let inner = num_heads * head_dim;
        let to_out = candle_nn::linear(inner, dim, vb.pp("to_out.0"))?;
        let to_add_out = candle_nn::linear(inner, dim, vb.pp("to_add_out"))?;
        Ok(Self {
            img,
            txt,
            to_out,
            to_add_out,
        })
    }

    fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        pe: &RotaryEmbedding,
    ) -> Result<(Tensor, Tensor)> {
        let txt_len = txt.dim(1)?;
        let img_len = img.dim(1)?;
        let (img_q, img_k, img_v) = self.img.forward(img)?;
        let (txt_q, txt_k, txt_v) = self.txt.forward(txt)?;

        let q = apply_rope(&Tensor::cat(&[&txt_q, &img_q], 2)?, pe)?;
        let k = apply_rope(&Tensor::cat(&[&txt_k, &img_k], 2)?, pe)?;
        let v = Tensor::cat(&[&txt_v, &img_v], 2)?;
        let attn = merge_heads(&attention(&q, &k, &v)?)?;

        let txt_attn = attn.narrow(1, 0, txt_len)?.apply(&self.to_add_out)?;
        let img_attn = attn.narrow(1, txt_len, img_len)?.apply(&self.to_out)?;
        Ok((img_attn, txt_attn))
    }
}

/// Block where text and image tokens keep separate weights but attend jointly.
#[derive(Debug, Clone)]
pub struct DoubleStreamBlock {
    norm1: Modulation,
    norm1_context: Modulation,
    norm: LayerNorm,
    attn: JointAttention,
    ff: FeedForward,
    ff_context: FeedForward,
}

impl DoubleStreamBlock {
    pub fn new(dim: usize, num_heads: usize, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: Modulation::new(dim, 6, vb.pp("norm1"))?,
            norm1_context: Modulation::new(dim, 6, vb.pp("norm1_context"))?,
            norm: layer_norm(dim, vb.device(), vb.dtype())?,
            attn: JointAttention::new(dim, num_heads, head_dim, vb.pp("attn"))?,
            ff: FeedForward::new(dim, vb.pp("ff"))?,
            ff_context: FeedForward::new(dim, vb.pp("ff_context"))?,
        })
    }

    /// Returns the updated (text, image) streams.
    pub fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        temb: &Tensor,
        pe: &RotaryEmbedding,
    ) -> Result<(Tensor, Tensor)> {
        let (img_mod1, img_mod2) = self.norm1.pair(temb)?;
        let (txt_mod1, txt_mod2) = self.norm1_context.pair(temb)?;

        let img_modulated = img_mod1.scale_shift(&img.apply(&self.norm)?)?;
        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.norm)?)?;
        let (img_attn, txt_attn) = self.attn.forward(&img_modulated, &txt_modulated, pe)?;

        let img = (img + img_mod1.gate(&img_attn)?)?;
        let img_mlp = self
            .ff
            .forward(&img_mod2.scale_shift(&img.apply(&self.norm)?)?)?;
        let img = (&img + img_mod2.gate(&img_mlp)?)?;

        let txt = (txt + txt_mod1.gate(&txt_attn)?)?;
        let txt_mlp = self
            .ff_context
            .forward(&txt_mod2.scale_shift(&txt.apply(&self.norm)?)?)?;
        let txt = (&txt + txt_mod2.gate(&txt_mlp)?)?;

        Ok((txt, img))
    }
}

/// Block over the merged [text, image] sequence with a parallel attention/MLP path.
#[derive(Debug, Clone)]
pub struct SingleStreamBlock {
    norm: Modulation,
    pre_norm: LayerNorm,
    attn: QkvProjection,
    proj_mlp: Linear,
    proj_out: Linear,
}

impl SingleStreamBlock {
    pub fn new(dim: usize, num_heads: usize, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        let mlp_dim = dim * 4;
        Ok(Self {
            norm: Modulation::new(dim, 3, vb.pp("norm"))?,
            pre_norm: layer_norm(dim, vb.device(), vb.dtype())?,
            attn: QkvProjection::new(
                dim,
                num_heads,
                head_dim,
                ["to_q", "to_k", "to_v", "norm_q", "norm_k"],
                &vb.pp("attn"),
            )?,
            proj_mlp: candle_nn::linear(dim, mlp_dim, vb.pp("proj_mlp"))?,
            proj_out: candle_nn::linear(dim + mlp_dim, dim, vb.pp("proj_out"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor, pe: &RotaryEmbedding) -> Result<Tensor> {
        let modulation = self.norm.single(temb)?;
        let x_mod = modulation.scale_shift(&xs.apply(&self.pre_norm)?)?;
        let mlp = x_mod.apply(&self.proj_mlp)?.gelu()?;
        let (q, k, v) = self.attn.forward(&x_mod)?;
        let attn = merge_heads(&attention(&apply_rope(&q, pe)?, &apply_rope(&k, pe)?, &v)?)?;
        let out = Tensor::cat(&[attn, mlp], 2)?.apply(&self.proj_out)?;
        xs + modulation.gate(&out)?
    }
}
