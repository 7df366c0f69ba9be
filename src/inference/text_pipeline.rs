use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use rand::random;
use tokenizers::Tokenizer;
use tracing::debug;

/// Tokens tried, in order, when looking up the end-of-sequence id.
const EOS_TOKENS: [&str; 5] = [
    "<|eot_id|>",
    "<|end_of_text|>",
    "</s>",
    "<|endoftext|>",
    "<|im_end|>",
];

/// Sampling controls for one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub repeat_penalty: f32,
    pub repeat_context_size: usize,
}

impl SamplingParams {
    /// Maps the controls onto candle's sampler. A non-positive temperature
    /// means greedy decoding, `top_k == 0` and `top_p >= 1` switch that filter off.
    pub fn sampling(&self) -> Sampling {
        if self.temperature <= 0. {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        let use_top_k = self.top_k > 0;
        let use_top_p = self.top_p > 0. && self.top_p < 1.;
        match (use_top_k, use_top_p) {
            (true, true) => Sampling::TopKThenTopP {
                k: self.top_k,
                p: self.top_p,
                temperature,
            },
            (true, false) => Sampling::TopK {
                k: self.top_k,
                temperature,
            },
            (false, true) => Sampling::TopP {
                p: self.top_p,
                temperature,
            },
            (false, false) => Sampling::All { temperature },
        }
    }
}

/// Prompt-in, text-out generation as the LLM handler uses it.
pub trait TextGenerator: Send {
    fn encode(&self, prompt: &str) -> Result<Vec<u32>>;

    /// Returns the decoded sequence and the generation time in seconds.
    fn generate(&mut self, prompt: &[u32], params: &SamplingParams) -> Result<(String, f64)>;
}

// Taken from
// https://github.com/huggingface/candle/blob/main/candle-examples/examples/quantized/main.rs
pub struct TextGeneratorPipeline {
    model: ModelWeights,
    device: Device,
    tokenizer: Tokenizer,
    eos_token_id: u32,
    pad_token_id: u32,
    seed: Option<u64>,
}

impl TextGeneratorPipeline {
    #[tracing::instrument(level = "info", skip(device))]
    pub fn with_quantized_gguf(
        model_dir: &Path,
        tokenizer_filename: &str,
        gguf_filename: &str,
        device: &Device,
        seed: Option<u64>,
    ) -> Result<TextGeneratorPipeline> {
        let tokenizer_file = model_dir.join(tokenizer_filename);
        let gguf_file = model_dir.join(gguf_filename);

        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| anyhow!("Cannot load tokenizer {}: {e}", tokenizer_file.display()))?;

        let mut file = std::fs::File::open(&gguf_file)
            .with_context(|| format!("Cannot open weights {}", gguf_file.display()))?;
        let model_reader =
            gguf_file::Content::read(&mut file).map_err(|e| e.with_path(&gguf_file))?;
        let model = ModelWeights::from_gguf(model_reader, &mut file, device)?;

        let eos_token_id = match EOS_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token))
        {
            Some(token) => token,
            None => bail!("Cannot find an end of sequence token in the tokenizer vocabulary"),
        };
        let pad_token_id = tokenizer
            .get_padding()
            .map(|padding| padding.pad_id)
            .unwrap_or(eos_token_id);

        Ok(TextGeneratorPipeline {
            model,
            device: device.clone(),
            tokenizer,
            eos_token_id,
            pad_token_id,
            seed,
        })
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Cannot encode prompt: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Samples up to `max_new_tokens` after the prompt and returns the decoded
    /// sequence, prompt included, along with the generation time in seconds.
    fn sample(&mut self, prompt: &[u32], params: &SamplingParams) -> Result<(String, f64)> {
        if prompt.is_empty() {
            bail!("Prompt is empty");
        }

        let mut logits_processor =
            LogitsProcessor::from_sampling(self.seed.unwrap_or(random()), params.sampling());
        let mut tokens = prompt.to_vec();

        let start_gen = Instant::now();
        for index in 0..params.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, start_pos)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if (params.repeat_penalty - 1.).abs() < f32::EPSILON {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(params.repeat_context_size);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if next_token == self.eos_token_id {
                break;
            }
        }
        let elapsed = start_gen.elapsed().as_secs_f64();
        debug!(
            "Generated {} tokens in {elapsed:.02}s",
            tokens.len() - prompt.len()
        );

        let output = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Cannot decode tokens: {e}"))?;
        Ok((output, elapsed))
    }
}

impl TextGenerator for TextGeneratorPipeline {
    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        self.encode_prompt(prompt)
    }

    fn generate(&mut self, prompt: &[u32], params: &SamplingParams) -> Result<(String, f64)> {
        self.sample(prompt, params)
    }
}
