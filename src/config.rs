use anyhow::{bail, Result};
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

#[derive(ClapSerde, Deserialize, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[arg(short, long, env, default_value = "0.0.0.0")]
    pub(crate) address: String,

    /// The port the listener binds to
    #[arg(short, long, env, default_value = "8080")]
    pub(crate) port: u16,

    /// Comma separated handlers to host, out of `llm` and `sd`
    #[arg(short, long, env, default_value = "llm,sd")]
    pub(crate) models: String,

    /// Deployment descriptor of the LLM handler
    #[arg(long, env, default_value = "llm/model-config.toml")]
    pub(crate) llm_model_config: String,

    /// Deployment descriptor of the Stable Diffusion handler
    #[arg(long, env, default_value = "sd/model-config.toml")]
    pub(crate) sd_model_config: String,

    /// Directory the Stable Diffusion model archive was extracted to
    #[arg(long, env, default_value = "sd")]
    pub(crate) sd_model_dir: String,

    /// Accelerator ordinal used when the descriptor asks for a GPU
    #[arg(short, long, env, default_value = "0")]
    pub(crate) gpu_id: usize,

    /// OTLP collector endpoint, spans and metrics are only exported when set
    #[arg(short, long, env, default_value = "")]
    pub(crate) otlp_endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostedModel {
    Llm,
    StableDiffusion,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let config = toml::from_str(&str)?;
        Ok(config)
    }

    pub fn hosted_models(&self) -> Result<Vec<HostedModel>> {
        parse_models(&self.models)
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        Some(self.otlp_endpoint.as_str()).filter(|e| !e.is_empty())
    }
}

fn parse_models(models: &str) -> Result<Vec<HostedModel>> {
    let mut hosted = Vec::new();
    for model in models.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        let model = match model.to_lowercase().as_str() {
            "llm" => HostedModel::Llm,
            "sd" => HostedModel::StableDiffusion,
            other => bail!("Unknown model kind {other}, expected llm or sd"),
        };
        if !hosted.contains(&model) {
            hosted.push(model);
        }
    }
    if hosted.is_empty() {
        bail!("No models to host");
    }
    Ok(hosted)
}
