pub mod checkpoint;
pub mod llama_server;

pub use checkpoint::{Checkpoint, ModelParams};
pub use llama_server::LlamaServerGenerator;

use crate::dialog::{Dialog, Message};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Inputs to building a generator.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub ckpt_dir: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
}

/// Whether to restore the generation start state before completing and/or
/// persist it afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartState {
    pub load: bool,
    pub save: bool,
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Cap on generated tokens; `None` leaves it to the model's sequence budget.
    pub max_gen_len: Option<usize>,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: Option<u32>,
    pub start_state: StartState,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_gen_len: None,
            temperature: 0.6,
            top_p: 0.9,
            seed: None,
            start_state: StartState::default(),
        }
    }
}

impl CompletionOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::config(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_gen_len == Some(0) {
            return Err(Error::config("max_gen_len must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// One generated reply for one dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPrediction {
    pub generation: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatPrediction {
    pub fn new(generation: Message) -> Self {
        Self {
            generation,
            usage: None,
        }
    }
}

/// Chat-completion capability. Returns exactly one prediction per input dialog,
/// in input order.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn chat_completion(
        &self,
        dialogs: &[Dialog],
        options: &CompletionOptions,
    ) -> Result<Vec<ChatPrediction>>;
}
