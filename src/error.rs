//! Error taxonomy for the tutoring pipeline

use std::time::Duration;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, TutorError>;

/// Errors surfaced by the request pipeline.
///
/// Validation never touches the model or any session. Generation timeouts and
/// failures are recoverable per-request; only a failed model load at startup
/// leaves the process unable to serve chat traffic.
#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    /// The request was rejected before reaching the pipeline
    #[error("{0}")]
    Validation(String),

    /// The model is not loaded or crashed during startup
    #[error("model service is not available: {0}")]
    ModelUnavailable(String),

    /// Generation exceeded its wall-clock budget
    #[error("generation timed out after {duration:?}")]
    GenerationTimeout {
        /// Budget that was exceeded
        duration: Duration,
    },

    /// The underlying numeric engine failed mid-generation
    #[error("generation failed: {0}")]
    Generation(String),

    /// Invalid startup configuration
    #[error("configuration error for {parameter}: {message}")]
    Configuration {
        /// Offending parameter name
        parameter: String,
        /// What was wrong with it
        message: String,
    },
}

impl TutorError {
    /// Message safe to return to a client. Internal generation detail is
    /// logged server-side and replaced with a generic message here.
    pub fn client_message(&self) -> String {
        match self {
            TutorError::Validation(msg) => msg.clone(),
            TutorError::ModelUnavailable(_) => {
                "Model service is not available. Please try again later.".to_string()
            }
            TutorError::GenerationTimeout { .. } => {
                "The tutor took too long to answer. Please try again.".to_string()
            }
            TutorError::Generation(_) | TutorError::Configuration { .. } => {
                "An error occurred while processing your message. Please try again.".to_string()
            }
        }
    }
}
