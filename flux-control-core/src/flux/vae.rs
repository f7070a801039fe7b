use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux::autoencoder::{Config, Decoder, Encoder};

/// The Flux autoencoder with a deterministic encoder: control images map to
/// the posterior mean instead of a random sample, so identical inputs always
/// give identical control latents.
pub struct FluxVae {
    encoder: Encoder,
    decoder: Decoder,
    shift_factor: f64,
    scale_factor: f64,
}

impl FluxVae {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(cfg, vb.pp("encoder"))?;
        let decoder = Decoder::new(cfg, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            shift_factor: cfg.shift_factor,
            scale_factor: cfg.scale_factor,
        })
    }

    /// (b, 3, h, w) pixels in [-1, 1] to scaled (b, 16, h/8, w/8) latents.
    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        let moments = self.encoder.forward(xs)?;
        let mean = moments.chunk(2, 1)?.remove(0);
        (mean - self.shift_factor)? * self.scale_factor
    }

    pub fn decode(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = ((xs / self.scale_factor)? + self.shift_factor)?;
        self.decoder.forward(&xs)
    }
}
