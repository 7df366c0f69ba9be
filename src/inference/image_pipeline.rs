use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::clip::{ClipTextTransformer, Config as ClipConfig};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::{build_clip_transformer, StableDiffusionConfig};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Which diffusion pipeline to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineVariant {
    Standard,
    Xl,
    /// Few-step latent-consistency UNet on top of an XL base.
    LatentConsistency,
}

impl PipelineVariant {
    /// `is_lcm` wins over `is_xl`.
    pub fn from_flags(is_xl: bool, is_lcm: bool) -> Self {
        if is_lcm {
            PipelineVariant::LatentConsistency
        } else if is_xl {
            PipelineVariant::Xl
        } else {
            PipelineVariant::Standard
        }
    }

    fn sd_config(&self) -> StableDiffusionConfig {
        match self {
            PipelineVariant::Standard => StableDiffusionConfig::v1_5(None, None, None),
            PipelineVariant::Xl => StableDiffusionConfig::sdxl(None, None, None),
            PipelineVariant::LatentConsistency => StableDiffusionConfig::sdxl_turbo(None, None, None),
        }
    }

    /// Latent scaling used when the VAE config does not state one.
    fn default_vae_scale(&self) -> f64 {
        match self {
            PipelineVariant::Standard => 0.18215,
            PipelineVariant::Xl | PipelineVariant::LatentConsistency => 0.13025,
        }
    }

    fn unet_dir(&self) -> &'static str {
        match self {
            PipelineVariant::LatentConsistency => "lcm",
            _ => "unet",
        }
    }

    fn text_encoder_count(&self) -> usize {
        match self {
            PipelineVariant::Standard => 1,
            PipelineVariant::Xl | PipelineVariant::LatentConsistency => 2,
        }
    }
}

/// Resolved parameters of one text-to-image call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    pub height: usize,
    pub width: usize,
}

/// Tokenizer files that replace the `tokenizer{,_2}/tokenizer.json` lookup,
/// relative to the checkpoint directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenizerFiles {
    pub first: Option<PathBuf>,
    pub second: Option<PathBuf>,
}

/// Locates the tokenizer of one text encoder. An override wins over the
/// `tokenizer{suffix}/tokenizer.json` convention.
fn tokenizer_file(ckpt: &Path, suffix: &str, configured: Option<&Path>) -> Result<PathBuf> {
    let path = match configured {
        Some(file) => ckpt.join(file),
        None => ckpt.join(format!("tokenizer{suffix}")).join("tokenizer.json"),
    };
    if !path.is_file() {
        bail!(
            "Tokenizer file {} not found, export tokenizer.json or set tokenizer_file{} in the handler settings",
            path.display(),
            if suffix.is_empty() { "" } else { "_2" }
        );
    }
    Ok(path)
}

/// Fits encoded ids to the encoder's context: longer prompts are cut, keeping
/// the final end-of-text token, shorter ones are padded.
fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        warn!(
            "Prompt has {} tokens, only the first {max_len} are used",
            tokens.len()
        );
        let last = tokens[tokens.len() - 1];
        tokens.truncate(max_len);
        if let Some(end) = tokens.last_mut() {
            *end = last;
        }
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// `scaling_factor` of `vae/config.json`, when the checkpoint has one.
fn vae_scaling_factor(vae_dir: &Path) -> Result<Option<f64>> {
    let config_file = vae_dir.join("config.json");
    if !config_file.is_file() {
        return Ok(None);
    }
    let config: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&config_file)?)
        .map_err(|e| anyhow!("Malformed VAE config {}: {e}", config_file.display()))?;
    Ok(config.get("scaling_factor").and_then(serde_json::Value::as_f64))
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_position_embeddings: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn load(
        dir: &Path,
        suffix: &str,
        tokenizer_override: Option<&Path>,
        config: &ClipConfig,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer_file = tokenizer_file(dir, suffix, tokenizer_override)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| anyhow!("Cannot load tokenizer {}: {e}", tokenizer_file.display()))?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = match tokenizer.token_to_id(pad_token) {
            Some(id) => id,
            None => bail!("Cannot find padding token {pad_token}"),
        };

        let weights = weights_file(&dir.join(format!("text_encoder{suffix}")), "model", DType::F32)?;
        let model = build_clip_transformer(config, weights, device, DType::F32)?;

        Ok(Self {
            tokenizer,
            model,
            max_position_embeddings: config.max_position_embeddings,
            pad_id,
        })
    }

    fn embed(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Cannot encode prompt: {e}"))?
            .get_ids()
            .to_vec();
        let tokens = fit_tokens(tokens, self.max_position_embeddings, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/stable-diffusion/main.rs
pub struct ImageGeneratorPipeline {
    variant: PipelineVariant,
    sd_config: StableDiffusionConfig,
    device: Device,
    dtype: DType,
    text_encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    vae_scale: f64,
}

impl ImageGeneratorPipeline {
    /// Loads a diffusers-layout checkpoint directory.
    #[tracing::instrument(level = "info", skip(device))]
    pub fn load(
        ckpt: &Path,
        variant: PipelineVariant,
        device: &Device,
        use_flash_attn: bool,
        tokenizers: &TokenizerFiles,
    ) -> Result<Self> {
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        info!("Loading the {variant:?} pipeline using dtype: {dtype:?}");
        let sd_config = variant.sd_config();

        let mut text_encoders = vec![TextEncoder::load(
            ckpt,
            "",
            tokenizers.first.as_deref(),
            &sd_config.clip,
            device,
        )?];
        if variant.text_encoder_count() > 1 {
            let clip2 = sd_config
                .clip2
                .as_ref()
                .ok_or_else(|| anyhow!("{variant:?} pipeline has no second text encoder"))?;
            text_encoders.push(TextEncoder::load(
                ckpt,
                "_2",
                tokenizers.second.as_deref(),
                clip2,
                device,
            )?);
        }

        let unet_weights = weights_file(
            &ckpt.join(variant.unet_dir()),
            "diffusion_pytorch_model",
            dtype,
        )?;
        let unet = sd_config.build_unet(unet_weights, device, 4, use_flash_attn, dtype)?;

        let vae_dir = ckpt.join("vae");
        let vae_weights = weights_file(&vae_dir, "diffusion_pytorch_model", dtype)?;
        let vae = sd_config.build_vae(vae_weights, device, dtype)?;
        let vae_scale = vae_scaling_factor(&vae_dir)?.unwrap_or(variant.default_vae_scale());
        info!("Using VAE scaling factor {vae_scale}");

        Ok(Self {
            variant,
            sd_config,
            device: device.clone(),
            dtype,
            text_encoders,
            unet,
            vae,
            vae_scale,
        })
    }

    pub fn variant(&self) -> PipelineVariant {
        self.variant
    }

    fn text_embeddings(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let mut embeddings = Vec::with_capacity(self.text_encoders.len());
        for encoder in &self.text_encoders {
            let cond = encoder.embed(prompt, &self.device)?;
            let embedding = if use_guidance {
                let uncond = encoder.embed("", &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(embedding.to_dtype(self.dtype)?);
        }
        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }

    /// Runs the denoising loop and returns one `(3, height, width)` `u8` tensor per image.
    pub fn generate(&self, params: &GenerationParams) -> Result<Vec<Tensor>> {
        let use_guidance = params.guidance_scale > 1.;
        let text_embeddings = self.text_embeddings(&params.prompt, use_guidance)?;

        let mut scheduler = self.sd_config.build_scheduler(params.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!("step {}/{} done", index + 1, timesteps.len());
        }

        let images = self.vae.decode(&(&latents / self.vae_scale)?)?;
        let images = ((images / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let images = (images.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;

        let (batch, _, _, _) = images.dims4()?;
        let images = (0..batch)
            .map(|i| images.i(i))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(images)
    }
}

/// Prefers the half-precision export when running in F16.
fn weights_file(dir: &Path, stem: &str, dtype: DType) -> Result<PathBuf> {
    let fp16 = dir.join(format!("{stem}.fp16.safetensors"));
    let full = dir.join(format!("{stem}.safetensors"));
    let candidates = if dtype == DType::F16 {
        [fp16, full]
    } else {
        [full, fp16]
    };
    match candidates.iter().find(|path| path.exists()) {
        Some(path) => Ok(path.clone()),
        None => bail!("No {stem} weights found in {}", dir.display()),
    }
}
