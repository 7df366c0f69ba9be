use std::fmt::Display;

use anyhow::{anyhow, Result};

/// Separator that replaces `/` in hub-style model ids, so the id can be used
/// as a directory and a registered model name.
pub const NAME_SEPARATOR: &str = "---";

pub const LLM_MODEL_ENV: &str = "MODEL_NAME_LLM";
pub const SD_MODEL_ENV: &str = "MODEL_NAME_SD";

/// A model id such as `meta-llama/Llama-3.2-3B-Instruct`, stored in its
/// registered form `meta-llama---Llama-3.2-3B-Instruct`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelName(String);

impl ModelName {
    pub fn new(id: &str) -> Self {
        ModelName(id.replace('/', NAME_SEPARATOR))
    }

    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(id) if !id.is_empty() => Ok(Self::new(&id)),
            _ => Err(anyhow!("Environment variable {var} is not set")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the organisation prefix, used for display.
    pub fn short(&self) -> &str {
        self.0
            .split(NAME_SEPARATOR)
            .nth(1)
            .unwrap_or(self.0.as_str())
    }
}

impl Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
