//! Request orchestration
//!
//! The façade between the HTTP surface and the pipeline. Each request moves
//! through receive → validate → context → render → generate → commit, and
//! every failure path maps onto the documented error taxonomy. Side effects
//! are confined to session-store mutation and engine invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{GenerationConfig, ServiceConfig};
use crate::context::ContextBuilder;
use crate::engine::Generator;
use crate::error::{Result, TutorError};
use crate::prompt;
use crate::session::SessionStore;
use crate::types::{GenerationRequest, Turn};

/// Appended when the model's answer comes back suspiciously short.
const SHORT_ANSWER_NOTE: &str =
    "\n\nWould you like me to explain this topic in more detail or provide additional examples?";
const SHORT_ANSWER_CHARS: usize = 50;

/// Successful outcome of one chat request.
#[derive(Debug, Clone)]
pub struct ChatReply {
    /// Cleaned answer text
    pub response: String,
    /// Session the exchange was recorded under; server-issued when the
    /// client did not supply one
    pub session_id: String,
}

/// Orchestrates sessions, context, templating and generation for incoming
/// chat traffic.
pub struct RequestHandler {
    store: Arc<SessionStore>,
    context: ContextBuilder,
    generator: Option<Arc<dyn Generator>>,
    generation: GenerationConfig,
    max_message_chars: usize,
    request_timeout: Duration,
}

impl RequestHandler {
    /// `generator` is `None` when the model failed to load at startup; chat
    /// requests then resolve to `ModelUnavailable` until the process is
    /// restarted with working artifacts.
    pub fn new(
        config: &ServiceConfig,
        store: Arc<SessionStore>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Self {
        Self {
            store,
            context: ContextBuilder::new(config.context.clone()),
            generator,
            generation: config.generation.clone(),
            max_message_chars: config.server.max_message_chars,
            request_timeout: config.server.request_timeout,
        }
    }

    /// Whether the engine behind this handler is loaded and serving.
    pub fn model_loaded(&self) -> bool {
        self.generator.is_some()
    }

    /// Shared session store, for surfaces that operate on sessions
    /// directly.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Process one chat message end to end.
    ///
    /// On success the user/tutor pair is committed atomically together with
    /// the topic update. On generation failure or timeout the whole
    /// exchange is discarded, so history never contains an unanswered
    /// question.
    pub async fn handle_chat(&self, message: &str, session_id: Option<&str>) -> Result<ChatReply> {
        let message = validate_message(message, self.max_message_chars)?;

        // Opportunistic TTL sweep; no dedicated scheduler thread.
        self.store.evict_stale(Instant::now());

        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| TutorError::ModelUnavailable("model not loaded".to_string()))?;

        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (turns, current_topic) = {
            let handle = self.store.get_or_create(&session_id);
            let session = handle.lock().await;
            (
                session.turns().to_vec(),
                session.current_topic().map(str::to_string),
            )
        };

        let decision = self
            .context
            .evaluate(&message, current_topic.as_deref(), &turns);
        debug!(
            session_id = %session_id,
            is_follow_up = decision.is_follow_up,
            topic = ?decision.topic,
            history_turns = turns.len(),
            "context built"
        );

        let prompt = match decision.context_block.as_deref() {
            Some(block) if decision.is_follow_up => prompt::render_with_context(
                &message,
                decision
                    .topic
                    .as_deref()
                    .unwrap_or(prompt::UNKNOWN_TOPIC_LABEL),
                block,
            ),
            _ => prompt::render(&message),
        };

        let request = GenerationRequest {
            prompt,
            max_new_tokens: self.generation.max_new_tokens,
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            deterministic: self.generation.deterministic,
        };

        // Bounds queue + compute time as a whole; the engine applies its
        // own tighter budget to the forward pass alone.
        let result = match tokio::time::timeout(self.request_timeout, generator.generate(request))
            .await
        {
            Err(_) => {
                return Err(TutorError::GenerationTimeout {
                    duration: self.request_timeout,
                })
            }
            Ok(outcome) => outcome?,
        };

        let mut answer = result.answer_text;
        if answer.chars().count() < SHORT_ANSWER_CHARS {
            answer.push_str(SHORT_ANSWER_NOTE);
        }

        let user_turn = Turn::user(message, decision.topic.clone());
        let tutor_turn = Turn::tutor(answer.clone(), decision.topic.clone());
        self.store
            .commit_exchange(&session_id, user_turn, tutor_turn, decision.topic)
            .await;

        info!(
            session_id = %session_id,
            truncated = result.truncated,
            generated_tokens = result.generated_tokens,
            "exchange committed"
        );

        Ok(ChatReply {
            response: answer,
            session_id,
        })
    }

    /// Clear a session's history. Always succeeds, including for ids that
    /// were never seen.
    pub async fn handle_clear(&self, session_id: &str) {
        self.store.clear(session_id).await;
    }
}

fn validate_message(message: &str, max_chars: usize) -> Result<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(TutorError::Validation("Message cannot be empty".to_string()));
    }
    if trimmed.chars().count() > max_chars {
        return Err(TutorError::Validation(format!(
            "Message too long (max {max_chars} characters)"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::{GenerationResult, Role};
    use parking_lot::Mutex;

    /// Records prompts and answers with a canned response derived from the
    /// prompt, mimicking a cleaned generation.
    struct EchoGenerator {
        prompts: Mutex<Vec<String>>,
    }

    impl EchoGenerator {
        fn new() -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
            self.prompts.lock().push(request.prompt.clone());
            let answer = format!(
                "Here is a worked explanation responding to the request: {}",
                request.prompt.lines().nth(1).unwrap_or_default()
            );
            Ok(GenerationResult {
                raw_output: format!("{}{}", request.prompt, answer),
                answer_text: answer,
                truncated: false,
                generated_tokens: 42,
                processing_time: Duration::from_millis(5),
            })
        }
    }

    struct FailingGenerator;

    #[async_trait::async_trait]
    impl Generator for FailingGenerator {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResult> {
            Err(TutorError::Generation("matmul shape mismatch".to_string()))
        }
    }

    struct SlowGenerator {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Generator for SlowGenerator {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
            tokio::time::sleep(self.delay).await;
            Ok(GenerationResult {
                raw_output: request.prompt,
                answer_text: "too late".to_string(),
                truncated: false,
                generated_tokens: 1,
                processing_time: self.delay,
            })
        }
    }

    fn handler_with(generator: Option<Arc<dyn Generator>>) -> (RequestHandler, Arc<SessionStore>) {
        let config = ServiceConfig::default();
        let store = Arc::new(SessionStore::new(config.session.clone()));
        (
            RequestHandler::new(&config, store.clone(), generator),
            store,
        )
    }

    #[tokio::test]
    async fn test_empty_message_rejected_without_touching_sessions() {
        let (handler, store) = handler_with(Some(Arc::new(EchoGenerator::new())));

        for bad in ["", "   ", "\n\t "] {
            let err = handler.handle_chat(bad, Some("abc")).await.unwrap_err();
            assert!(matches!(err, TutorError::Validation(_)));
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (handler, store) = handler_with(Some(Arc::new(EchoGenerator::new())));
        let long = "x".repeat(2001);
        let err = handler.handle_chat(&long, None).await.unwrap_err();
        assert!(matches!(err, TutorError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_model_maps_to_unavailable() {
        let (handler, store) = handler_with(None);
        let err = handler
            .handle_chat("What is energy?", Some("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::ModelUnavailable(_)));
        assert!(store.is_empty());
        assert!(!handler.model_loaded());
    }

    #[tokio::test]
    async fn test_successful_exchange_commits_pair_and_topic() {
        let (handler, store) = handler_with(Some(Arc::new(EchoGenerator::new())));

        let reply = handler
            .handle_chat("What is Newton's second law?", Some("abc"))
            .await
            .unwrap();
        assert!(!reply.response.is_empty());
        assert_eq!(reply.session_id, "abc");

        let handle = store.get_or_create("abc");
        let session = handle.lock().await;
        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "What is Newton's second law?");
        assert_eq!(turns[1].role, Role::Tutor);
        assert_eq!(session.current_topic(), Some("newton laws"));
        assert_eq!(turns[0].topic_tag.as_deref(), Some("newton laws"));
    }

    #[tokio::test]
    async fn test_follow_up_prompt_carries_prior_exchange() {
        let generator = Arc::new(EchoGenerator::new());
        let (handler, store) = handler_with(Some(generator.clone()));

        handler
            .handle_chat("What is Newton's second law?", Some("abc"))
            .await
            .unwrap();
        handler
            .handle_chat("give me an analogy", Some("abc"))
            .await
            .unwrap();

        let prompts = generator.prompts.lock();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Recent conversation:"));
        assert!(prompts[1].contains("continuing a conversation about newton laws"));
        assert!(prompts[1].contains("User asked: What is Newton's second law?"));
        assert!(prompts[1].contains("User's follow-up request: give me an analogy"));

        let handle = store.get_or_create("abc");
        let session = handle.lock().await;
        assert_eq!(session.turns().len(), 4);
    }

    #[tokio::test]
    async fn test_server_issues_session_id_when_absent() {
        let (handler, store) = handler_with(Some(Arc::new(EchoGenerator::new())));
        let reply = handler.handle_chat("What is energy?", None).await.unwrap();
        assert!(!reply.session_id.is_empty());

        let handle = store.get_or_create(&reply.session_id);
        let session = handle.lock().await;
        assert_eq!(session.turns().len(), 2);
    }

    #[tokio::test]
    async fn test_generation_failure_discards_whole_exchange() {
        let (handler, store) = handler_with(Some(Arc::new(FailingGenerator)));

        let err = handler
            .handle_chat("What is energy?", Some("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::Generation(_)));

        let handle = store.get_or_create("abc");
        let session = handle.lock().await;
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn test_request_timeout_bounds_slow_generation() {
        let config = ServiceConfig {
            server: crate::config::ServerConfig {
                request_timeout: Duration::from_millis(20),
                ..ServiceConfig::default().server
            },
            ..ServiceConfig::default()
        };
        let store = Arc::new(SessionStore::new(config.session.clone()));
        let handler = RequestHandler::new(
            &config,
            store.clone(),
            Some(Arc::new(SlowGenerator {
                delay: Duration::from_secs(5),
            })),
        );

        let err = handler
            .handle_chat("What is energy?", Some("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::GenerationTimeout { .. }));

        let handle = store.get_or_create("abc");
        let session = handle.lock().await;
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn test_short_answer_gets_follow_up_note() {
        struct Terse;

        #[async_trait::async_trait]
        impl Generator for Terse {
            async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResult> {
                Ok(GenerationResult {
                    raw_output: "F = ma".to_string(),
                    answer_text: "F = ma".to_string(),
                    truncated: false,
                    generated_tokens: 4,
                    processing_time: Duration::from_millis(1),
                })
            }
        }

        let (handler, _store) = handler_with(Some(Arc::new(Terse)));
        let reply = handler
            .handle_chat("What is Newton's second law?", Some("abc"))
            .await
            .unwrap();
        assert!(reply.response.starts_with("F = ma"));
        assert!(reply.response.ends_with("additional examples?"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_one_session_keep_pairs_ordered() {
        let (handler, store) = handler_with(Some(Arc::new(EchoGenerator::new())));
        let handler = Arc::new(handler);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler
                    .handle_chat(&format!("Tell me about the number {i}"), Some("shared"))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let handle = store.get_or_create("shared");
        let session = handle.lock().await;
        let turns = session.turns();
        // Retention cap may prune the oldest pairs, but what remains is
        // whole pairs in a total order.
        assert!(turns.len() % 2 == 0);
        for pair in turns.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Tutor);
            assert!(pair[1].text.contains(&pair[0].text));
        }
        for window in turns.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
    }
}
