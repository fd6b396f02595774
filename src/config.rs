//! Startup configuration for the tutoring service

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};

/// Top-level service configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub session: SessionConfig,
    pub context: ContextConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding config.json, tokenizer.json and *.safetensors
    pub model_path: PathBuf,

    /// Maximum sequence length the model was trained with
    pub max_sequence_length: usize,

    /// Whether to use flash attention kernels
    pub flash_attention: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard ceiling on generated tokens per request
    pub max_new_tokens: usize,

    /// Sampling temperature
    pub temperature: f64,

    /// Nucleus sampling threshold
    pub top_p: f64,

    /// Repetition penalty applied over the recent context
    pub repetition_penalty: f32,

    /// Number of recent tokens the repetition penalty looks at
    pub repetition_context_size: usize,

    /// Sampling seed
    pub seed: u64,

    /// Disable sampling and take the argmax at every step
    pub deterministic: bool,

    /// Wall-clock budget for a single forward-generation pass
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is reclaimed
    pub ttl: Duration,

    /// Maximum turns retained per session; oldest pruned first
    pub retention_turns: usize,

    /// Process-wide bound on concurrently held sessions
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum prior turns surfaced in a follow-up prompt
    pub max_turns: usize,

    /// Character budget for the assembled context block, kept well under
    /// the model's hard context window
    pub max_chars: usize,

    /// Per-turn cap on tutor text quoted back into the context
    pub turn_excerpt_chars: usize,

    /// Messages at or below this word count count as follow-ups when a
    /// topic is already established
    pub follow_up_word_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Maximum accepted message length in characters
    pub max_message_chars: usize,

    /// Total queue + compute budget per request, independent of the
    /// generation timeout
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                model_path: PathBuf::from("tutor_model_lora"),
                max_sequence_length: 2048,
                flash_attention: false,
            },
            generation: GenerationConfig {
                max_new_tokens: 500,
                temperature: 0.7,
                top_p: 0.95,
                repetition_penalty: 1.1,
                repetition_context_size: 128,
                seed: 299792458,
                deterministic: false,
                timeout: Duration::from_secs(30),
            },
            session: SessionConfig {
                ttl: Duration::from_secs(1800),
                retention_turns: 10,
                max_sessions: 1000,
            },
            context: ContextConfig {
                max_turns: 4,
                max_chars: 1600,
                turn_excerpt_chars: 400,
                follow_up_word_limit: 3,
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7860,
                max_message_chars: 2000,
                request_timeout: Duration::from_secs(60),
            },
        }
    }
}

impl ServiceConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("MODEL_PATH") {
            config.model.model_path = PathBuf::from(path);
        }
        if let Some(v) = parse_env("MAX_SEQ_LENGTH") {
            config.model.max_sequence_length = v;
        }
        if let Some(v) = parse_env("MAX_NEW_TOKENS") {
            config.generation.max_new_tokens = v;
        }
        if let Some(v) = parse_env("GENERATION_TIMEOUT_SECS") {
            config.generation.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_env("DETERMINISTIC") {
            config.generation.deterministic = v;
        }
        if let Some(v) = parse_env("SESSION_TTL_SECS") {
            config.session.ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_env("SESSION_RETENTION_TURNS") {
            config.session.retention_turns = v;
        }
        if let Some(v) = parse_env("MAX_SESSIONS") {
            config.session.max_sessions = v;
        }
        if let Some(v) = parse_env("REQUEST_TIMEOUT_SECS") {
            config.server.request_timeout = Duration::from_secs(v);
        }
        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }
        if let Some(v) = parse_env("PORT") {
            config.server.port = v;
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.model_path.as_os_str().is_empty() {
            return Err(TutorError::Configuration {
                parameter: "model_path".to_string(),
                message: "Model path cannot be empty".to_string(),
            });
        }

        if self.generation.max_new_tokens == 0 {
            return Err(TutorError::Configuration {
                parameter: "max_new_tokens".to_string(),
                message: "Token budget must be positive".to_string(),
            });
        }

        if self.generation.max_new_tokens >= self.model.max_sequence_length {
            return Err(TutorError::Configuration {
                parameter: "max_new_tokens".to_string(),
                message: "Token budget must leave room for the prompt".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.generation.top_p) {
            return Err(TutorError::Configuration {
                parameter: "top_p".to_string(),
                message: "Nucleus threshold must be between 0 and 1".to_string(),
            });
        }

        if self.context.max_chars == 0 {
            return Err(TutorError::Configuration {
                parameter: "context.max_chars".to_string(),
                message: "Context budget must be positive".to_string(),
            });
        }

        if self.session.retention_turns < 2 {
            return Err(TutorError::Configuration {
                parameter: "retention_turns".to_string(),
                message: "Retention cap must hold at least one exchange".to_string(),
            });
        }

        if self.session.max_sessions == 0 {
            return Err(TutorError::Configuration {
                parameter: "max_sessions".to_string(),
                message: "Session cap must be positive".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
