use std::path::PathBuf;

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::handler::{single_request, Context, Handler, HandlerError, HandlerState, RequestItem};
use crate::inference::text_pipeline::{SamplingParams, TextGenerator, TextGeneratorPipeline};
use crate::model_name::{ModelName, LLM_MODEL_ENV};

/// Fixed for every request, the request cannot override it.
pub const REPETITION_PENALTY: f32 = 1.2;
const REPEAT_CONTEXT_SIZE: usize = 64;

/// Returned instead of generated text when generation fails.
pub const PLACEHOLDER_TEXT: &str = " ";

lazy_static! {
    static ref BRACKETED: Regex = Regex::new(r"\[(.*?)\]").expect("valid bracket pattern");
}

#[derive(Deserialize, Debug, Clone)]
pub struct LlmSettings {
    /// Root that holds one `<model name>/model` directory per model.
    pub model_store_dir: PathBuf,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_weights_file")]
    pub weights_file: String,
    #[serde(default = "default_tokenizer_file")]
    pub tokenizer_file: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_stream() -> bool {
    true
}

fn default_weights_file() -> String {
    "model.gguf".into()
}

fn default_tokenizer_file() -> String {
    "tokenizer.json".into()
}

#[derive(Deserialize, Debug, Clone)]
pub struct LlmRequest {
    pub user_prompt: String,
    pub prompt_template: String,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
}

impl LlmRequest {
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: REPETITION_PENALTY,
            repeat_context_size: REPEAT_CONTEXT_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedPrompt {
    pub tokens: Vec<u32>,
    pub params: SamplingParams,
}

/// Result of one generation. A failure is recorded, not raised, so the batch
/// still gets an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Text(String),
    Failed,
}

impl Generation {
    pub fn text(&self) -> &str {
        match self {
            Generation::Text(text) => text,
            Generation::Failed => PLACEHOLDER_TEXT,
        }
    }
}

/// Text generation handler. Expands a user prompt into a list of prompts the
/// model wrote between square brackets.
#[derive(Default)]
pub struct LlmHandler {
    pipeline: Option<Box<dyn TextGenerator>>,
    stream: bool,
    user_prompt: String,
}

impl LlmHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler around an already loaded generator.
    pub fn with_generator(generator: Box<dyn TextGenerator>) -> Self {
        Self {
            pipeline: Some(generator),
            ..Self::default()
        }
    }

    fn pipeline(&mut self) -> Result<&mut Box<dyn TextGenerator>, HandlerError> {
        self.pipeline
            .as_mut()
            .ok_or(HandlerError::NotReady(HandlerState::Uninitialized))
    }
}

impl Handler for LlmHandler {
    type Settings = LlmSettings;
    type Input = EncodedPrompt;
    type Output = Generation;
    type Response = Vec<Vec<String>>;

    #[tracing::instrument(level = "info", skip_all)]
    fn initialize(&mut self, ctx: &Context<LlmSettings>) -> Result<()> {
        let settings = &ctx.model_config.handler;
        let model_name = ModelName::from_env(LLM_MODEL_ENV)?;
        let model_dir = settings
            .model_store_dir
            .join(model_name.as_str())
            .join("model");

        self.stream = settings.stream;
        let device = ctx
            .model_config
            .device_type
            .device(ctx.system_properties.gpu_id)?;

        info!("Model config is {:?}", ctx.model_config);
        info!("System properties are {:?}", ctx.system_properties);
        info!("Using device={:?}, stream={}", device, self.stream);
        info!(
            "Compiler backend {} is not used by this runtime, loading {} as is",
            ctx.model_config.pt2.backend,
            model_dir.display()
        );

        let pipeline = TextGeneratorPipeline::with_quantized_gguf(
            &model_dir,
            &settings.tokenizer_file,
            &settings.weights_file,
            &device,
            settings.seed,
        )?;
        info!(
            "Loaded {} (eos token id {}, pad token id {})",
            model_name,
            pipeline.eos_token_id(),
            pipeline.pad_token_id()
        );
        self.pipeline = Some(Box::new(pipeline));
        Ok(())
    }

    fn preprocess(&mut self, requests: &[RequestItem]) -> Result<EncodedPrompt> {
        let request: LlmRequest = single_request(requests)?.decode()?;
        let tokens = self.pipeline()?.encode(&request.prompt_template)?;
        self.user_prompt = request.user_prompt.clone();

        Ok(EncodedPrompt {
            tokens,
            params: request.sampling_params(),
        })
    }

    fn inference(&mut self, input: EncodedPrompt) -> Result<Generation> {
        let pipeline = self.pipeline()?;
        match pipeline.generate(&input.tokens, &input.params) {
            Ok((text, inference_time)) => {
                info!("LLM generation took {inference_time:.02} seconds");
                Ok(Generation::Text(text))
            }
            Err(err) => {
                error!("An error occurred during LLM inference: {err}");
                Ok(Generation::Failed)
            }
        }
    }

    fn postprocess(&mut self, output: Generation) -> Result<Vec<Vec<String>>> {
        info!("LLM generated output: {}", output.text());
        let prompts = extract_prompts(&self.user_prompt, output.text());
        info!("Extracted prompt list: {prompts:?}");
        Ok(vec![prompts])
    }
}

/// Returns the user prompt followed by the `;`-separated items of the first
/// `[...]` group in `generated`.
pub fn extract_prompts(user_prompt: &str, generated: &str) -> Vec<String> {
    let mut prompts = vec![user_prompt.to_string()];
    match BRACKETED.captures(generated).and_then(|c| c.get(1)) {
        Some(inner) => prompts.extend(inner.as_str().split(';').map(|s| s.trim().to_string())),
        None => warn!("No match found in the generated output text"),
    }
    prompts
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handler::{HandlerService, ModelConfig};

    struct ScriptedGenerator {
        reply: Option<&'static str>,
        seen: std::sync::Arc<std::sync::Mutex<Option<SamplingParams>>>,
    }

    impl ScriptedGenerator {
        fn failing() -> Self {
            Self {
                reply: None,
                seen: Default::default(),
            }
        }

        fn replying(reply: &'static str) -> Self {
            Self {
                reply: Some(reply),
                seen: Default::default(),
            }
        }
    }

    impl TextGenerator for ScriptedGenerator {
        fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
            Ok(prompt.bytes().map(u32::from).collect())
        }

        fn generate(&mut self, _: &[u32], params: &SamplingParams) -> Result<(String, f64)> {
            *self.seen.lock().unwrap() = Some(*params);
            match self.reply {
                Some(reply) => Ok((reply.to_string(), 0.1)),
                None => anyhow::bail!("CUDA out of memory"),
            }
        }
    }

    fn castle_request() -> RequestItem {
        RequestItem::from_json(json!({
            "user_prompt": "castle",
            "prompt_template": "Generate prompts for castle",
            "max_new_tokens": 50,
            "temperature": 0.8,
            "top_k": 50,
            "top_p": 0.9
        }))
    }

    #[test]
    fn generation_failure_serves_user_prompt() {
        let handler = LlmHandler::with_generator(Box::new(ScriptedGenerator::failing()));
        let mut service = HandlerService::ready("llm", handler);

        let response = service.handle(&[castle_request()]).unwrap();
        assert_eq!(response, vec![vec!["castle".to_string()]]);
    }

    #[test]
    fn generation_failure_is_recorded_not_raised() {
        let mut handler = LlmHandler::with_generator(Box::new(ScriptedGenerator::failing()));
        let input = handler.preprocess(&[castle_request()]).unwrap();
        assert_eq!(handler.inference(input).unwrap(), Generation::Failed);
    }

    #[test]
    fn serves_extracted_prompts() {
        let generator = ScriptedGenerator::replying("Generate prompts for castle [a moat; a keep]");
        let seen = generator.seen.clone();
        let mut service = HandlerService::ready("llm", LlmHandler::with_generator(Box::new(generator)));

        let response = service.handle(&[castle_request()]).unwrap();
        assert_eq!(response, vec![vec!["castle", "a moat", "a keep"]]);

        let params = seen.lock().unwrap().unwrap();
        assert_eq!(params.max_new_tokens, 50);
        assert_eq!(params.repeat_penalty, REPETITION_PENALTY);
        assert_eq!(params.repeat_context_size, 64);
    }

    #[test]
    fn extracts_bracketed_prompts() {
        let generated = "Here are some ideas: [a; b; c] enjoy!";
        assert_eq!(
            extract_prompts("castle", generated),
            vec!["castle", "a", "b", "c"]
        );
    }

    #[test]
    fn uses_first_bracket_group_only() {
        let generated = "[red castle;  blue castle ] and [ignored]";
        assert_eq!(
            extract_prompts("castle", generated),
            vec!["castle", "red castle", "blue castle"]
        );
    }

    #[test]
    fn echoes_prompt_without_brackets() {
        assert_eq!(
            extract_prompts("castle", "no list in this answer"),
            vec!["castle"]
        );
    }

    #[test]
    fn brackets_do_not_span_lines() {
        assert_eq!(extract_prompts("castle", "[a;\nb]"), vec!["castle"]);
    }

    #[test]
    fn failed_generation_degrades_to_prompt() {
        let mut handler = LlmHandler::new();
        handler.user_prompt = "a fantasy landscape".into();
        let response = handler.postprocess(Generation::Failed).unwrap();
        assert_eq!(response, vec![vec!["a fantasy landscape".to_string()]]);
    }

    #[test]
    fn preprocess_rejects_batches_other_than_one() {
        let mut handler = LlmHandler::new();
        let request = RequestItem::from_json(json!({
            "user_prompt": "castle",
            "prompt_template": "Generate prompts for castle",
            "max_new_tokens": 50,
            "temperature": 0.8,
            "top_k": 50,
            "top_p": 0.9
        }));
        let err = handler
            .preprocess(&[request.clone(), request])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::BatchSize {
                expected: 1,
                actual: 2
            })
        ));

        let err = handler.preprocess(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::BatchSize { actual: 0, .. })
        ));
    }

    #[test]
    fn request_uses_fixed_repetition_penalty() {
        let request: LlmRequest = RequestItem::from_body(
            br#"{"user_prompt": "castle", "prompt_template": "t", "max_new_tokens": 20,
                 "temperature": 0.5, "top_k": 10, "top_p": 0.95}"#
                .to_vec(),
        )
        .decode()
        .unwrap();
        let params = request.sampling_params();
        assert_eq!(params.max_new_tokens, 20);
        assert_eq!(params.top_k, 10);
        assert_eq!(params.repeat_penalty, REPETITION_PENALTY);
    }

    #[test]
    fn settings_defaults() {
        let config: ModelConfig<LlmSettings> =
            ModelConfig::from_toml_str("[handler]\nmodel_store_dir = \"/home/model-server/model-store\"\n")
                .unwrap();
        let settings = config.handler;
        assert!(settings.stream);
        assert_eq!(settings.weights_file, "model.gguf");
        assert_eq!(settings.tokenizer_file, "tokenizer.json");
        assert_eq!(settings.seed, None);
    }
}
