use std::path::PathBuf;

use anyhow::Result;
use candle_core::Tensor;
use serde::Deserialize;
use tracing::info;

use crate::handler::{
    single_request, Context, Handler, HandlerError, HandlerState, Pt2Config, RequestItem,
};
use crate::inference::image_pipeline::{
    GenerationParams, ImageGeneratorPipeline, PipelineVariant, TokenizerFiles,
};

pub const DEFAULT_GUIDANCE_SCALE: f64 = 5.0;
pub const DEFAULT_INFERENCE_STEPS: usize = 5;
pub const DEFAULT_HEIGHT: usize = 768;
pub const DEFAULT_WIDTH: usize = 768;

const MAX_AUTOTUNE: &str = "max-autotune";

#[derive(Deserialize, Debug, Clone)]
pub struct ImageSettings {
    /// Checkpoint directory, relative to the model directory.
    pub model_path: PathBuf,
    pub num_inference_steps: usize,
    #[serde(default)]
    pub compile_unet: bool,
    #[serde(default)]
    pub compile_vae: bool,
    #[serde(default = "default_compile_mode")]
    pub compile_mode: String,
    #[serde(default)]
    pub change_comp_config: bool,
    #[serde(default)]
    pub is_xl: bool,
    #[serde(default)]
    pub is_lcm: bool,
    /// `tokenizer.json` of the first text encoder, relative to `model_path`.
    #[serde(default)]
    pub tokenizer_file: Option<PathBuf>,
    /// `tokenizer.json` of the second text encoder of XL checkpoints.
    #[serde(default)]
    pub tokenizer_file_2: Option<PathBuf>,
}

fn default_compile_mode() -> String {
    "default".into()
}

/// How the pipeline components would be compiled. The runtime has no graph
/// compiler, so the plan is logged and UNet compilation turns on flash
/// attention when the crate is built with it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilePlan {
    pub backend: String,
    pub options: toml::Table,
    pub unet: bool,
    pub vae: bool,
    /// Extra tuning for `max-autotune` runs that asked for a changed compiler config.
    pub tuned: bool,
}

impl CompilePlan {
    pub fn new(settings: &ImageSettings, pt2: &Pt2Config) -> Self {
        let any = settings.compile_unet || settings.compile_vae;
        Self {
            backend: pt2.backend.clone(),
            options: pt2.options.clone(),
            unet: settings.compile_unet,
            vae: settings.compile_vae,
            tuned: any && settings.compile_mode == MAX_AUTOTUNE && settings.change_comp_config,
        }
    }

    pub fn use_flash_attn(&self) -> bool {
        self.unet && cfg!(feature = "flash-attn")
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub num_inference_steps: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
}

impl ImageRequest {
    /// Fills omitted parameters with the defaults. Zero counts as omitted, any
    /// other guidance scale is used as given.
    pub fn resolve(self) -> Result<GenerationParams, HandlerError> {
        let params = GenerationParams {
            prompt: self.prompt,
            guidance_scale: self
                .guidance_scale
                .filter(|g| *g != 0.)
                .unwrap_or(DEFAULT_GUIDANCE_SCALE),
            num_inference_steps: self
                .num_inference_steps
                .filter(|s| *s != 0)
                .unwrap_or(DEFAULT_INFERENCE_STEPS),
            height: self.height.filter(|h| *h != 0).unwrap_or(DEFAULT_HEIGHT),
            width: self.width.filter(|w| *w != 0).unwrap_or(DEFAULT_WIDTH),
        };

        if params.height % 8 != 0 || params.width % 8 != 0 {
            return Err(HandlerError::InvalidParameter(format!(
                "height and width must be multiples of 8, got {}x{}",
                params.height, params.width
            )));
        }
        Ok(params)
    }
}

/// `height x width x [r, g, b]`
pub type ImageArray = Vec<Vec<Vec<u8>>>;

/// Text-to-image handler over a Stable Diffusion pipeline.
#[derive(Default)]
pub struct ImageHandler {
    pipeline: Option<ImageGeneratorPipeline>,
    configured_steps: usize,
}

impl ImageHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Handler for ImageHandler {
    type Settings = ImageSettings;
    type Input = GenerationParams;
    type Output = Vec<Tensor>;
    type Response = Vec<ImageArray>;

    #[tracing::instrument(level = "info", skip_all)]
    fn initialize(&mut self, ctx: &Context<ImageSettings>) -> Result<()> {
        let settings = &ctx.model_config.handler;
        let device = ctx
            .model_config
            .device_type
            .device(ctx.system_properties.gpu_id)?;
        self.configured_steps = settings.num_inference_steps;

        info!("Model config is {:?}", ctx.model_config);
        info!("System properties are {:?}", ctx.system_properties);
        info!(
            "Using device={:?}, configured inference steps={}",
            device, self.configured_steps
        );

        let plan = CompilePlan::new(settings, &ctx.model_config.pt2);
        info!("Loading model with compile plan: {plan:?}");

        let ckpt = ctx.system_properties.model_dir.join(&settings.model_path);
        let variant = PipelineVariant::from_flags(settings.is_xl, settings.is_lcm);
        let tokenizers = TokenizerFiles {
            first: settings.tokenizer_file.clone(),
            second: settings.tokenizer_file_2.clone(),
        };
        let pipeline = ImageGeneratorPipeline::load(
            &ckpt,
            variant,
            &device,
            plan.use_flash_attn(),
            &tokenizers,
        )?;

        info!(
            "Stable Diffusion {:?} pipeline loaded successfully: {}",
            pipeline.variant(),
            ckpt.display()
        );
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn preprocess(&mut self, requests: &[RequestItem]) -> Result<GenerationParams> {
        let request: ImageRequest = single_request(requests)?.decode()?;
        Ok(request.resolve()?)
    }

    fn inference(&mut self, input: GenerationParams) -> Result<Vec<Tensor>> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(HandlerError::NotReady(HandlerState::Uninitialized))?;
        info!(
            "Generating {}x{} image with {} steps, guidance {}",
            input.width, input.height, input.num_inference_steps, input.guidance_scale
        );
        pipeline.generate(&input)
    }

    fn postprocess(&mut self, output: Vec<Tensor>) -> Result<Vec<ImageArray>> {
        output.iter().map(image_to_array).collect()
    }
}

/// Converts a `(3, height, width)` `u8` tensor into nested pixel rows.
pub fn image_to_array(image: &Tensor) -> Result<ImageArray> {
    Ok(image.permute((1, 2, 0))?.contiguous()?.to_vec3::<u8>()?)
}
