use candle_core::{Device, Result, Tensor};
use candle_transformers::models::flux::sampling::State;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use super::controlnet::{ControlLatents, MultiControlNet};
use super::transformer::FluxTransformer;

/// Dev-model resolution shift passed to `get_schedule`: (base shift, max shift).
pub const SCHEDULE_SHIFT: (f64, f64) = (0.5, 1.15);

/// Rounds a pixel dimension up to the 16-pixel latent granularity.
pub fn latent_grid(dim: usize) -> usize {
    dim.div_ceil(16) * 16
}

/// Initial latent noise of shape (1, 16, h/8, w/8) for a `height`x`width` image,
/// drawn on the host from a generator seeded with `seed` and then moved to
/// `device`. Unlike the device RNG this is reproducible on every backend.
pub fn seeded_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let (h, w) = (height.div_ceil(16) * 2, width.div_ceil(16) * 2);
    let count = 16 * h * w;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(count + 1);
    // Box-Muller, two normals per pair of uniforms
    while data.len() < count {
        let u1 = 1.0 - rng.random::<f32>();
        let u2 = rng.random::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        data.push(r * theta.cos());
        data.push(r * theta.sin());
    }
    data.truncate(count);
    Tensor::from_vec(data, (1, 16, h, w), &Device::Cpu)?.to_device(device)
}

/// Packs (batch, c, h, w) latents into 2x2 patches of shape (batch, h/2 * w/2, c * 4),
/// the same layout `State::new` uses for the noise.
pub fn pack(latents: &Tensor) -> Result<Tensor> {
    let (b_sz, c, h, w) = latents.dims4()?;
    latents
        .reshape((b_sz, c, h / 2, 2, w / 2, 2))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b_sz, h / 2 * w / 2, c * 4))
}

/// Euler flow-matching loop with ControlNet residuals recomputed at every step.
pub fn denoise(
    model: &FluxTransformer,
    controlnet: &MultiControlNet,
    state: &State,
    controls: &[ControlLatents],
    timesteps: &[f64],
    guidance: f64,
) -> Result<Tensor> {
    let b_sz = state.img.dim(0)?;
    let dev = state.img.device();
    let dtype = state.img.dtype();
    let guidance = Tensor::full(guidance as f32, b_sz, dev)?.to_dtype(dtype)?;
    let total = timesteps.len().saturating_sub(1);
    let mut img = state.img.clone();
    for (step, window) in timesteps.windows(2).enumerate() {
        let (t_curr, t_prev) = (window[0], window[1]);
        let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?.to_dtype(dtype)?;
        let residuals = controlnet.forward(
            &img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &t_vec,
            &state.vec,
            Some(&guidance),
            controls,
        )?;
        let pred = model.forward(
            &img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &t_vec,
            &state.vec,
            Some(&guidance),
            residuals.as_ref(),
        )?;
        img = (img + pred * (t_prev - t_curr))?;
        debug!(step = step + 1, total, "denoising");
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flux::config::TransformerConfig;
    use crate::flux::controlnet::FluxControlNet;
    use crate::flux::transformer::tests::tiny_config;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use candle_transformers::models::flux::sampling::{get_noise, unpack};

    #[test]
    fn grid_rounds_up_to_16() {
        assert_eq!(latent_grid(96), 96);
        assert_eq!(latent_grid(200), 208);
        assert_eq!(latent_grid(512), 512);
        assert_eq!(latent_grid(8), 16);
    }

    #[test]
    fn seeded_noise_is_reproducible() -> Result<()> {
        let dev = Device::Cpu;
        let first = seeded_noise(42, 200, 96, &dev)?;
        let second = seeded_noise(42, 200, 96, &dev)?;
        let other = seeded_noise(43, 200, 96, &dev)?;
        assert_eq!(first.dims(), get_noise(1, 200, 96, &dev)?.dims());
        let first = first.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, second.flatten_all()?.to_vec1::<f32>()?);
        assert_ne!(first, other.flatten_all()?.to_vec1::<f32>()?);

        let n = first.len() as f32;
        let mean = first.iter().sum::<f32>() / n;
        let var = first.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.).abs() < 0.15, "variance {var}");
        Ok(())
    }

    #[test]
    fn pack_inverts_unpack() -> Result<()> {
        let dev = Device::Cpu;
        let latents = Tensor::randn(0f32, 1., (1, 16, 12, 26), &dev)?;
        let packed = pack(&latents)?;
        assert_eq!(packed.dims(), &[1, 6 * 13, 64]);
        // unpack takes pixel dimensions
        let back = unpack(&packed, 96, 208)?;
        let diff = (back - &latents)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        Ok(())
    }

    #[test]
    fn pack_matches_noise_state_layout() -> Result<()> {
        let dev = Device::Cpu;
        let noise = get_noise(1, 64, 48, &dev)?;
        let txt = Tensor::zeros((1, 3, 12), DType::F32, &dev)?;
        let vec = Tensor::zeros((1, 6), DType::F32, &dev)?;
        let state = State::new(&txt, &vec, &noise)?;
        let diff = (pack(&noise)? - &state.img)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        Ok(())
    }

    #[test]
    fn zero_velocity_keeps_latents() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = TransformerConfig {
            in_channels: 64,
            ..tiny_config()
        };
        let model = FluxTransformer::new(&cfg, VarBuilder::zeros(DType::F32, &dev))?;
        let net_cfg = TransformerConfig {
            num_layers: 1,
            num_single_layers: 1,
            num_mode: Some(10),
            ..cfg.clone()
        };
        let net = FluxControlNet::new(&net_cfg, VarBuilder::zeros(DType::F32, &dev))?;
        let controlnet = MultiControlNet::new(vec![net])?;

        let noise = get_noise(1, 32, 32, &dev)?;
        let txt = Tensor::randn(0f32, 1., (1, 3, 12), &dev)?;
        let vec = Tensor::randn(0f32, 1., (1, 6), &dev)?;
        let state = State::new(&txt, &vec, &noise)?;
        let controls = [ControlLatents {
            latents: Tensor::randn(0f32, 1., state.img.dims(), &dev)?,
            mode: 0,
            scale: 0.2,
        }];
        let out = denoise(&model, &controlnet, &state, &controls, &[1., 0.5, 0.], 3.5)?;
        assert_eq!(out.dims(), state.img.dims());
        let diff = (out - &state.img)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        Ok(())
    }

    #[test]
    fn same_seed_denoises_identically_on_cpu() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = TransformerConfig {
            in_channels: 64,
            ..tiny_config()
        };
        let model = FluxTransformer::new(&cfg, VarBuilder::zeros(DType::F32, &dev))?;
        let net_cfg = TransformerConfig {
            num_layers: 1,
            num_single_layers: 1,
            num_mode: Some(10),
            ..cfg.clone()
        };
        let net = FluxControlNet::new(&net_cfg, VarBuilder::zeros(DType::F32, &dev))?;
        let controlnet = MultiControlNet::new(vec![net])?;
        let txt = Tensor::ones((1, 3, 12), DType::F32, &dev)?;
        let vec = Tensor::ones((1, 6), DType::F32, &dev)?;

        let run = |seed: u64| -> Result<Vec<f32>> {
            let noise = seeded_noise(seed, 32, 48, &dev)?;
            let state = State::new(&txt, &vec, &noise)?;
            denoise(&model, &controlnet, &state, &[], &[1., 0.6, 0.2, 0.], 3.5)?
                .flatten_all()?
                .to_vec1::<f32>()
        };
        let first = run(7)?;
        assert_eq!(first, run(7)?);
        assert_ne!(first, run(8)?);
        Ok(())
    }
}
