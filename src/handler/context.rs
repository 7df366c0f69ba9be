use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use candle_core::Device;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Everything a handler receives at initialization.
#[derive(Debug, Clone)]
pub struct Context<S> {
    pub model_config: ModelConfig<S>,
    pub system_properties: SystemProperties,
}

impl<S: DeserializeOwned> Context<S> {
    pub fn load(descriptor: impl AsRef<Path>, system_properties: SystemProperties) -> Result<Self> {
        Ok(Self {
            model_config: ModelConfig::from_toml(descriptor)?,
            system_properties,
        })
    }
}

/// Per-model deployment descriptor. Worker and batching keys belong to the
/// daemon and are only carried for logging.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig<S> {
    #[serde(default)]
    pub min_workers: Option<u32>,
    #[serde(default)]
    pub max_workers: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub max_batch_delay: Option<u32>,
    #[serde(default)]
    pub response_timeout: Option<u32>,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub pt2: Pt2Config,
    pub handler: S,
}

impl<S: DeserializeOwned> ModelConfig<S> {
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config {}", path.display()))?;
        Self::from_toml_str(&str)
            .with_context(|| format!("Failed to parse model config {}", path.display()))
    }

    pub fn from_toml_str(str: &str) -> Result<Self> {
        Ok(toml::from_str(str)?)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Cpu,
    #[serde(alias = "cuda")]
    Gpu,
    #[serde(alias = "metal")]
    Mps,
}

impl DeviceType {
    pub fn device(&self, ordinal: usize) -> Result<Device> {
        let device = match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Gpu => Device::new_cuda(ordinal)?,
            DeviceType::Mps => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

/// Compiler section. `options` is passed through untouched.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Pt2Config {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub options: toml::Table,
}

impl Default for Pt2Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            options: toml::Table::new(),
        }
    }
}

fn default_backend() -> String {
    "inductor".into()
}

#[derive(Debug, Clone)]
pub struct SystemProperties {
    /// Directory the model archive was extracted to.
    pub model_dir: PathBuf,
    pub gpu_id: usize,
    /// Batch size the daemon was configured with for this model.
    pub batch_size: usize,
}

impl SystemProperties {
    pub fn new(model_dir: PathBuf) -> Self {
        Self {
            model_dir,
            gpu_id: 0,
            batch_size: 1,
        }
    }

    pub fn with_gpu_id(mut self, gpu_id: usize) -> Self {
        self.gpu_id = gpu_id;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
