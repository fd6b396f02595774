//! Common type definitions used throughout the service

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Who produced a turn within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The student asking questions
    User,
    /// The model's answer
    Tutor,
}

/// One message within a session. Immutable once appended; `seq` is a
/// monotonic order marker assigned by the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Who produced this turn
    pub role: Role,
    /// Message text, non-empty after trimming
    pub text: String,
    /// Position within the session, assigned on append
    pub seq: u64,
    /// Inferred subject label, when one was recognized
    pub topic_tag: Option<String>,
}

impl Turn {
    /// Create a user turn. The order marker is assigned on append.
    pub fn user(text: impl Into<String>, topic_tag: Option<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            seq: 0,
            topic_tag,
        }
    }

    /// Create a tutor turn. The order marker is assigned on append.
    pub fn tutor(text: impl Into<String>, topic_tag: Option<String>) -> Self {
        Self {
            role: Role::Tutor,
            text: text.into(),
            seq: 0,
            topic_tag,
        }
    }
}

/// One inference call: a rendered prompt plus sampling limits. Ephemeral,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Fully rendered prompt string
    pub prompt: String,
    /// Hard ceiling on generated tokens
    pub max_new_tokens: usize,
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling threshold
    pub top_p: f64,
    /// Disable sampling and take the argmax at every step
    pub deterministic: bool,
}

/// Output of one generation pass, handed to the caller by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Full decoded model output, template scaffolding included
    pub raw_output: String,
    /// Response-section content after cleanup
    pub answer_text: String,
    /// True when the token ceiling was hit before a natural stop
    pub truncated: bool,
    /// Number of tokens generated
    pub generated_tokens: usize,
    /// Wall-clock time spent in the forward passes
    pub processing_time: Duration,
}
