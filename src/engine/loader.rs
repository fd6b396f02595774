//! Model artifact loading

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Llama, LlamaConfig};
use tokenizers::Tokenizer;
use tracing::info;

use crate::config::ModelConfig;
use super::generation::LoadedModel;

/// Load config.json, tokenizer.json and the safetensors shards from the
/// model directory. Weights are memory-mapped in reduced precision: BF16 on
/// an accelerator, F32 on CPU.
pub(super) fn load(config: &ModelConfig) -> Result<LoadedModel> {
    let dir = &config.model_path;
    if !dir.is_dir() {
        bail!("model directory not found: {}", dir.display());
    }

    let device = Device::cuda_if_available(0).context("failed to initialize compute device")?;
    let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };

    let config_path = dir.join("config.json");
    let config_bytes = std::fs::read(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let llama_config: LlamaConfig = serde_json::from_slice(&config_bytes)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    let model_config = llama_config.into_config(config.flash_attention);

    let tokenizer_path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed to load {}", tokenizer_path.display()))?;

    let weight_paths = safetensors_paths(dir)?;
    info!(
        shards = weight_paths.len(),
        dtype = ?dtype,
        "loading model weights"
    );

    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_paths, dtype, &device)? };
    let model = Llama::load(vb, &model_config).context("failed to build model from weights")?;

    Ok(LoadedModel {
        model,
        config: model_config,
        tokenizer,
        device,
        dtype,
    })
}

fn safetensors_paths(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();

    if paths.is_empty() {
        bail!("no .safetensors files in {}", dir.display());
    }

    // Shard order matters for multi-file checkpoints.
    paths.sort();
    Ok(paths)
}
