use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

/// Connection settings for the llama.cpp-compatible inference server.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Env var holding the server's `--api-key`, if it was started with one.
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub slot_id: u32,
    /// File name passed to the slot save/restore endpoints.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub cache_prompt: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: None,
            slot_id: 0,
            state_file: default_state_file(),
            timeout_secs: default_timeout_secs(),
            cache_prompt: true,
        }
    }
}

impl ServerConfig {
    pub fn api_key(&self) -> Option<String> {
        let env_var = self
            .api_key_env
            .as_deref()
            .unwrap_or(DEFAULT_API_KEY_ENV);
        std::env::var(env_var).ok()
    }
}

#[derive(Debug, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Unset means "up to the model's sequence budget".
    pub max_gen_len: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: Option<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_seq_len: default_max_seq_len(),
            max_batch_size: default_max_batch_size(),
            max_gen_len: None,
            seed: default_seed(),
        }
    }
}

const DEFAULT_API_KEY_ENV: &str = "LLAMA_SERVER_API_KEY";

// Defaults
fn default_base_url() -> String {
    std::env::var("LLAMA_SERVER_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into())
}
fn default_state_file() -> String {
    "start_state.bin".into()
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.6
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_seq_len() -> usize {
    512
}
fn default_max_batch_size() -> usize {
    8
}
fn default_seed() -> Option<u32> {
    Some(1)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.trim().is_empty() {
            return Err(Error::config("server.base_url is empty"));
        }
        if self.server.timeout_secs == 0 {
            return Err(Error::config("server.timeout_secs must be positive"));
        }
        if self.sampling.max_seq_len == 0 {
            return Err(Error::config("max_seq_len must be at least 1"));
        }
        if self.sampling.max_batch_size == 0 {
            return Err(Error::config("max_batch_size must be at least 1"));
        }
        Ok(())
    }
}
