use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SHARD_EXTENSIONS: [&str; 2] = ["pth", "gguf"];

/// Model hyper-parameters from `params.json`. Every field is optional since
/// converted checkpoints often carry only a subset.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ModelParams {
    pub dim: Option<u32>,
    pub n_layers: Option<u32>,
    pub n_heads: Option<u32>,
    pub n_kv_heads: Option<u32>,
    /// `-1` in Meta's release means "take it from the tokenizer".
    pub vocab_size: Option<i64>,
    pub multiple_of: Option<u32>,
    pub norm_eps: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub dir: PathBuf,
    /// Shard files, sorted by name.
    pub shards: Vec<PathBuf>,
    pub params: Option<ModelParams>,
}

impl Checkpoint {
    pub fn discover(ckpt_dir: &Path) -> Result<Self> {
        if !ckpt_dir.is_dir() {
            return Err(Error::checkpoint(format!(
                "checkpoint directory not found: {}",
                ckpt_dir.display()
            )));
        }

        let mut shards: Vec<PathBuf> = WalkDir::new(ckpt_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| SHARD_EXTENSIONS.contains(&ext))
            })
            .collect();
        shards.sort();

        if shards.is_empty() {
            return Err(Error::checkpoint(format!(
                "no checkpoint files (*.pth, *.gguf) found in {}",
                ckpt_dir.display()
            )));
        }

        let params_path = ckpt_dir.join("params.json");
        let params = if params_path.is_file() {
            let content = std::fs::read_to_string(&params_path)?;
            let params: ModelParams = serde_json::from_str(&content)
                .map_err(|e| Error::parse(format!("{}: {e}", params_path.display())))?;
            Some(params)
        } else {
            None
        };

        Ok(Self {
            dir: ckpt_dir.to_path_buf(),
            shards,
            params,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

pub fn check_tokenizer(tokenizer_path: &Path) -> Result<()> {
    if tokenizer_path.is_file() {
        Ok(())
    } else {
        Err(Error::checkpoint(format!(
            "tokenizer not found: {}",
            tokenizer_path.display()
        )))
    }
}
