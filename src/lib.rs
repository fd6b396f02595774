//! Tutor Engine - conversation pipeline for a fine-tuned tutoring model
//!
//! This crate turns independent HTTP calls into coherent multi-turn
//! tutoring dialogues: it tracks sessions, decides when a message is a
//! follow-up to prior context, renders the instruction template the model
//! was tuned on, and serializes access to the single GPU-resident model.

#![warn(missing_docs)]

// Public modules
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod prompt;
pub mod server;
pub mod session;
pub mod types;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::ServiceConfig;
pub use context::{ContextBuilder, ContextDecision, TopicClassifier};
pub use engine::{Generator, InferenceEngine};
pub use error::{Result, TutorError};
pub use handler::{ChatReply, RequestHandler};
pub use session::SessionStore;
pub use types::{GenerationRequest, GenerationResult, Role, Turn};
