//! Inference engine owning the single loaded model/tokenizer pair
//!
//! The loaded model is an expensive, non-thread-safe resource: exactly one
//! generation executes against it at any instant, process-wide. Callers
//! queue on the inference gate; the gate is held until the forward pass
//! finishes, even when the caller has already given up on the result.

mod generation;
mod loader;

pub use generation::cleanup;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{GenerationConfig, ServiceConfig};
use crate::error::{Result, TutorError};
use crate::types::{GenerationRequest, GenerationResult};
use generation::LoadedModel;

/// The seam between the request pipeline and the model. The engine below is
/// the production implementation; tests substitute their own.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    /// Run one forward-generation pass for the rendered prompt.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult>;
}

/// Static facts about the loaded engine, safe to read while a generation
/// is in flight.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    /// Device the weights live on ("cuda:0", "cpu", "metal")
    pub device: String,
    /// Directory the artifacts were loaded from
    pub model_path: PathBuf,
    /// Hard context window of the model
    pub max_sequence_length: usize,
}

/// Running counters, updated after each completed generation.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub total_requests: usize,
    pub total_generated_tokens: usize,
    pub last_latency: Option<Duration>,
}

/// Owns the model weights and serializes access to them.
pub struct InferenceEngine {
    gate: Arc<Mutex<LoadedModel>>,
    info: EngineInfo,
    generation: GenerationConfig,
    stats: RwLock<EngineStats>,
}

impl InferenceEngine {
    /// Load weights, tokenizer and model configuration from the artifact
    /// directory. Runs once at process start; an error here means the
    /// process cannot serve chat traffic.
    pub fn load(config: &ServiceConfig) -> anyhow::Result<Self> {
        let loaded = loader::load(&config.model)?;
        let info = EngineInfo {
            device: loaded.device_label().to_string(),
            model_path: config.model.model_path.clone(),
            max_sequence_length: config.model.max_sequence_length,
        };

        info!(
            device = %info.device,
            model_path = %info.model_path.display(),
            max_sequence_length = info.max_sequence_length,
            "model loaded"
        );

        Ok(Self {
            gate: Arc::new(Mutex::new(loaded)),
            info,
            generation: config.generation.clone(),
            stats: RwLock::new(EngineStats::default()),
        })
    }

    /// Facts about the engine. Does not contend on the inference gate.
    pub fn info(&self) -> EngineInfo {
        self.info.clone()
    }

    /// Counter snapshot. Does not contend on the inference gate.
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }
}

#[async_trait::async_trait]
impl Generator for InferenceEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let max_new_tokens = request.max_new_tokens;
        let timeout = self.generation.timeout;
        let generation = self.generation.clone();
        let max_sequence_length = self.info.max_sequence_length;

        // The guard moves into the blocking task, so the model stays busy
        // until the pass completes: a timed-out or disconnected caller
        // never aborts compute mid-kernel, it only stops waiting.
        let guard = self.gate.clone().lock_owned().await;
        let compute = tokio::task::spawn_blocking(move || {
            generation::run(&guard, &request, &generation, max_sequence_length)
        });

        let result = match tokio::time::timeout(timeout, compute).await {
            Err(_) => {
                warn!(max_new_tokens, ?timeout, "generation timed out; result will be discarded");
                return Err(TutorError::GenerationTimeout { duration: timeout });
            }
            Ok(Err(join_error)) => {
                error!(%join_error, "generation task panicked");
                return Err(TutorError::Generation(join_error.to_string()));
            }
            Ok(Ok(Err(fault))) => {
                error!(fault = %fault, "generation failed");
                return Err(TutorError::Generation(fault.to_string()));
            }
            Ok(Ok(Ok(result))) => result,
        };

        {
            let mut stats = self.stats.write();
            stats.total_requests += 1;
            stats.total_generated_tokens += result.generated_tokens;
            stats.last_latency = Some(result.processing_time);
        }

        info!(
            generated_tokens = result.generated_tokens,
            truncated = result.truncated,
            processing_time = ?result.processing_time,
            "generation complete"
        );

        Ok(result)
    }
}
