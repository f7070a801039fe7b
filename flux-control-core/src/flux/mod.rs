use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp};
use candle_nn::VarBuilder;
use candle_transformers::models::flux::autoencoder;
use candle_transformers::models::flux::sampling::{get_schedule, unpack, State};
use image::DynamicImage;
use tracing::{debug, info};

pub mod blocks;
pub mod config;
pub mod controlnet;
pub mod embeddings;
pub mod sampling;
pub mod text;
pub mod transformer;
pub mod vae;

use config::TransformerConfig;
use controlnet::{ControlLatents, FluxControlNet, MultiControlNet};
use text::{ClipEncoder, T5Encoder};
use transformer::FluxTransformer;
use vae::FluxVae;

use crate::{
    image_to_tensor, pad_to_grid, safetensors_files, select_best_device, tensor_to_image,
    ControlCondition, DeviceMap, GenerationParams, Loader, ModelLike, WeightPaths,
};

/// FLUX.1-dev with a multi-ControlNet attached.
pub struct FluxControlPipeline {
    device: Device,
    dtype: DType,
    t5: T5Encoder,
    clip: ClipEncoder,
    autoencoder: FluxVae,
    transformer: FluxTransformer,
    controlnet: MultiControlNet,
}

impl FluxControlPipeline {
    fn encode_controls(
        &self,
        conditions: &[ControlCondition],
        width: usize,
        height: usize,
    ) -> Result<Vec<ControlLatents>> {
        conditions
            .iter()
            .map(|condition| {
                let image = pad_to_grid(&condition.image, width as u32, height as u32);
                let pixels = image_to_tensor(&image, &self.device, self.dtype)?;
                let latents = self.autoencoder.encode(&pixels)?;
                Ok(ControlLatents {
                    latents: sampling::pack(&latents)?,
                    mode: condition.mode,
                    scale: condition.strength,
                })
            })
            .collect()
    }
}

impl ModelLike for FluxControlPipeline {
    fn run(&mut self, params: &GenerationParams) -> Result<DynamicImage> {
        info!(
            seed = params.seed,
            steps = params.steps,
            guidance = params.guidance_scale,
            size = %format!("{}x{}", params.width, params.height),
            conditions = params.conditioning.conditions.len(),
            "starting generation"
        );
        let t5_emb = self.t5.encode(&params.prompt)?.to_dtype(self.dtype)?;
        let clip_emb = self.clip.encode(&params.prompt)?.to_dtype(self.dtype)?;

        // the latent grid works at 16 pixel granularity; the output is cropped back
        let grid_w = sampling::latent_grid(params.width);
        let grid_h = sampling::latent_grid(params.height);
        let controls = self.encode_controls(&params.conditioning.conditions, grid_w, grid_h)?;
        debug!(controls = controls.len(), "control latents encoded");

        let noise = sampling::seeded_noise(params.seed, grid_h, grid_w, &self.device)?
            .to_dtype(self.dtype)?;
        let state = State::new(&t5_emb, &clip_emb, &noise)?;
        let (base_shift, max_shift) = sampling::SCHEDULE_SHIFT;
        let timesteps = get_schedule(params.steps, Some((state.img.dim(1)?, base_shift, max_shift)));

        let latents = sampling::denoise(
            &self.transformer,
            &self.controlnet,
            &state,
            &controls,
            &timesteps,
            params.guidance_scale,
        )?;
        let latents = unpack(&latents, grid_h, grid_w)?;
        let decoded = self.autoencoder.decode(&latents)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img = tensor_to_image(&img.i(0)?)?;
        info!("generation finished");
        Ok(img.crop_imm(0, 0, params.width as u32, params.height as u32))
    }
}

fn var_builder(dir: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let files = safetensors_files(dir)?;
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&files, dtype, device)
            .with_context(|| format!("failed to build var builder for {}", dir.display()))?
    };
    Ok(vb)
}

pub struct FluxControlLoader;

impl Loader for FluxControlLoader {
    type Model = FluxControlPipeline;

    fn load(paths: &WeightPaths, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        info!(device = ?device, dtype = ?dtype, "loading pipeline");

        // --- ControlNet ---
        let controlnet_config = TransformerConfig::from_file(paths.controlnet.join("config.json"))?;
        let controlnet = FluxControlNet::new(
            &controlnet_config,
            var_builder(&paths.controlnet, dtype, &device)?,
        )
        .context("failed to load ControlNet")?;
        let controlnet = MultiControlNet::new(vec![controlnet])?;
        info!(
            layers = controlnet_config.num_layers,
            single_layers = controlnet_config.num_single_layers,
            modes = ?controlnet_config.num_mode,
            "ControlNet loaded"
        );

        // --- Transformer ---
        let transformer_dir = paths.model.join("transformer");
        let transformer_config = TransformerConfig::from_file(transformer_dir.join("config.json"))?;
        let transformer =
            FluxTransformer::new(&transformer_config, var_builder(&transformer_dir, dtype, &device)?)
                .context("failed to load flux transformer")?;
        info!("flux transformer loaded");

        // --- Autoencoder ---
        let ae_file = paths.model.join("ae.safetensors");
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[ae_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = FluxVae::new(&autoencoder::Config::dev(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Text encoders ---
        let t5 = T5Encoder::load(&paths.model, dtype, &device)?;
        let clip = ClipEncoder::load(&paths.model, dtype, &device)?;
        info!("pipeline ready");

        Ok(FluxControlPipeline {
            device,
            dtype,
            t5,
            clip,
            autoencoder,
            transformer,
            controlnet,
        })
    }
}
