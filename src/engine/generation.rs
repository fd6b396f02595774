//! Forward-generation pass and output cleanup

use std::time::Instant;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaEosToks};
use tokenizers::Tokenizer;

use crate::config::GenerationConfig;
use crate::prompt::RESPONSE_MARKER;
use crate::types::{GenerationRequest, GenerationResult};

/// Everything generation needs, kept behind the inference gate.
#[derive(Debug)]
pub(super) struct LoadedModel {
    pub model: Llama,
    pub config: Config,
    pub tokenizer: Tokenizer,
    pub device: Device,
    pub dtype: DType,
}

impl LoadedModel {
    pub fn device_label(&self) -> &'static str {
        match &self.device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda:0",
            Device::Metal(_) => "metal",
        }
    }
}

/// One blocking generation pass. Enforces `max_new_tokens` as a hard
/// ceiling; a pass that hits it before a stop token reports
/// `truncated = true`.
pub(super) fn run(
    state: &LoadedModel,
    request: &GenerationRequest,
    generation: &GenerationConfig,
    max_sequence_length: usize,
) -> Result<GenerationResult> {
    let start = Instant::now();

    let encoding = state
        .tokenizer
        .encode(request.prompt.as_str(), true)
        .map_err(anyhow::Error::msg)?;
    let mut tokens: Vec<u32> = encoding.get_ids().to_vec();

    let prompt_budget = max_sequence_length.saturating_sub(request.max_new_tokens);
    trim_to_budget(&mut tokens, prompt_budget);
    let prompt_len = tokens.len();

    let mut cache = Cache::new(true, state.dtype, &state.config, &state.device)?;
    let (temperature, top_p) = if request.deterministic {
        (None, None)
    } else {
        (Some(request.temperature), Some(request.top_p))
    };
    let mut logits_processor = LogitsProcessor::new(generation.seed, temperature, top_p);

    let mut index_pos = 0;
    let mut truncated = true;

    for index in 0..request.max_new_tokens {
        let context_size = if index > 0 { 1 } else { tokens.len() };
        let context_index = if index > 0 { index_pos } else { 0 };
        let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];

        let input = Tensor::new(ctxt, &state.device)?.unsqueeze(0)?;
        let logits = state.model.forward(&input, context_index, &mut cache)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;

        let logits = if generation.repetition_penalty == 1.0 {
            logits
        } else {
            let penalty_start = tokens.len().saturating_sub(generation.repetition_context_size);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                generation.repetition_penalty,
                &tokens[penalty_start..],
            )?
        };

        index_pos += ctxt.len();
        let next_token = logits_processor.sample(&logits)?;
        tokens.push(next_token);

        if is_stop_token(state.config.eos_token_id.as_ref(), next_token) {
            truncated = false;
            break;
        }
    }

    let generated_tokens = tokens.len() - prompt_len;
    let raw_output = state
        .tokenizer
        .decode(&tokens, true)
        .map_err(anyhow::Error::msg)?;
    let answer_text = cleanup(&raw_output);

    Ok(GenerationResult {
        raw_output,
        answer_text,
        truncated,
        generated_tokens,
        processing_time: start.elapsed(),
    })
}

/// Strip echoed template scaffolding from raw model output and return only
/// the response-section content, trimmed. When no marker is present the
/// full trimmed output is returned; malformed output degrades to
/// best-effort text, never an error.
pub fn cleanup(raw_output: &str) -> String {
    match raw_output.rsplit_once(RESPONSE_MARKER) {
        Some((_, response)) => response.trim().to_string(),
        None => raw_output.trim().to_string(),
    }
}

fn is_stop_token(eos: Option<&LlamaEosToks>, token: u32) -> bool {
    match eos {
        Some(LlamaEosToks::Single(id)) => *id == token,
        Some(LlamaEosToks::Multiple(ids)) => ids.contains(&token),
        None => false,
    }
}

/// Drop the oldest tokens so the prompt leaves room for the generation
/// budget inside the model's context window.
fn trim_to_budget(tokens: &mut Vec<u32>, budget: usize) {
    if tokens.len() > budget {
        let excess = tokens.len() - budget;
        tokens.drain(..excess);
    }
}
