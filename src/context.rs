//! Follow-up classification and context-window assembly
//!
//! Decides whether an incoming message continues the current topic and, if
//! so, which prior turns to surface in the prompt. Pure with respect to the
//! session it reads; the caller applies the topic update together with the
//! turn append.

use crate::config::ContextConfig;
use crate::types::{Role, Turn};

/// Multi-word referential phrases that mark a message as a follow-up
const FOLLOW_UP_PHRASES: &[&str] = &[
    "give me analogy",
    "give me an analogy",
    "explain more",
    "tell me more",
    "help me understand",
    "show me",
    "can you",
    "what about",
    "how about",
    "what if",
    "follow up",
    "more details",
    "create a story",
    "short story",
    "make a story",
    "tell a story",
    "give me a story",
    "help me remember",
    "rap song",
    "make a rap",
    "create a rap",
    "write a song",
];

/// Single referential words, matched on word boundaries so "that" does not
/// fire inside "thatched"
const FOLLOW_UP_WORDS: &[&str] = &[
    "it", "that", "analogy", "example", "elaborate", "continue", "also", "another", "different",
    "more", "any", "some", "story", "song", "poem", "rhyme",
];

/// Pluggable subject inference. The keyword implementation below can be
/// swapped for a smarter classifier without touching the pipeline contract.
pub trait TopicClassifier: Send + Sync {
    /// Best-effort subject label for a message; `None` when nothing is
    /// recognized.
    fn classify(&self, message: &str) -> Option<String>;
}

/// Keyword-table classifier covering the subjects the model was tuned on.
/// Tables are checked in order; the first hit wins.
#[derive(Debug, Default)]
pub struct KeywordTopicClassifier;

const TOPIC_TABLE: &[(&[&str], &str)] = &[
    (&["vector", "vectors", "component", "components"], "vector addition"),
    (&["newton", "law", "laws", "force", "forces", "motion"], "newton laws"),
    (&["energy", "work", "power", "kinetic", "potential"], "energy"),
    (&["projectile", "trajectory"], "projectile motion"),
    (&["speed", "velocity", "acceleration"], "kinematics"),
    (&["ph", "acid", "acids", "base", "bases", "hydrogen"], "acids and bases"),
    (&["molarity", "concentration", "solution", "solutions"], "solutions"),
    (&["bond", "bonds", "ionic", "covalent", "electron", "electrons"], "chemical bonding"),
];

impl TopicClassifier for KeywordTopicClassifier {
    fn classify(&self, message: &str) -> Option<String> {
        let words: Vec<String> = message
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();

        for (keywords, tag) in TOPIC_TABLE {
            if words.iter().any(|w| keywords.contains(&w.as_str())) {
                return Some((*tag).to_string());
            }
        }
        None
    }
}

/// Outcome of classifying one incoming message against session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDecision {
    /// Whether the message continues the current topic
    pub is_follow_up: bool,
    /// Assembled prior-turn window, present only for follow-ups with
    /// non-empty history
    pub context_block: Option<String>,
    /// Topic to store once the exchange commits
    pub topic: Option<String>,
}

/// Classifies follow-ups and assembles bounded context windows.
pub struct ContextBuilder {
    config: ContextConfig,
    classifier: Box<dyn TopicClassifier>,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self::with_classifier(config, Box::new(KeywordTopicClassifier))
    }

    pub fn with_classifier(config: ContextConfig, classifier: Box<dyn TopicClassifier>) -> Self {
        Self { config, classifier }
    }

    /// Classify `message` against the session's current topic and history.
    ///
    /// Rules, in order:
    /// 1. An explicit subject keyword resets the topic and is never a
    ///    follow-up, regardless of length.
    /// 2. A referential phrase or word marks a follow-up.
    /// 3. A message at or below the word-count threshold while a topic is
    ///    established is a follow-up.
    /// 4. Anything else starts fresh; the topic becomes whatever the
    ///    classifier inferred (nothing → None).
    pub fn evaluate(
        &self,
        message: &str,
        current_topic: Option<&str>,
        turns: &[Turn],
    ) -> ContextDecision {
        let inferred = self.classifier.classify(message);

        if inferred.is_some() {
            return ContextDecision {
                is_follow_up: false,
                context_block: None,
                topic: inferred,
            };
        }

        let is_follow_up = matches_referential_pattern(message)
            || (word_count(message) <= self.config.follow_up_word_limit
                && current_topic.is_some());

        if is_follow_up {
            ContextDecision {
                is_follow_up: true,
                context_block: self.build_window(turns),
                topic: current_topic.map(str::to_string),
            }
        } else {
            ContextDecision {
                is_follow_up: false,
                context_block: None,
                topic: None,
            }
        }
    }

    /// Select the most recent turns, oldest first, within the character
    /// budget. Turns are dropped oldest-first from the window (never from
    /// the stored history) until the block fits.
    fn build_window(&self, turns: &[Turn]) -> Option<String> {
        if turns.is_empty() {
            return None;
        }

        let start = turns.len().saturating_sub(self.config.max_turns);
        let mut lines: Vec<String> = turns[start..]
            .iter()
            .map(|turn| self.format_turn(turn))
            .collect();

        while !lines.is_empty() && joined_len(&lines) > self.config.max_chars {
            lines.remove(0);
        }

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    fn format_turn(&self, turn: &Turn) -> String {
        match turn.role {
            Role::User => format!("User asked: {}", turn.text),
            Role::Tutor => {
                let excerpt = truncate_chars(&turn.text, self.config.turn_excerpt_chars);
                format!("Assistant explained: {}", excerpt)
            }
        }
    }
}

fn matches_referential_pattern(message: &str) -> bool {
    let lowered = message.to_lowercase();
    if FOLLOW_UP_PHRASES.iter().any(|p| lowered.contains(p)) {
        return true;
    }

    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .any(|w| FOLLOW_UP_WORDS.contains(&w))
}

fn word_count(message: &str) -> usize {
    message.split_whitespace().count()
}

fn joined_len(lines: &[String]) -> usize {
    let separators = lines.len().saturating_sub(1);
    lines.iter().map(|l| l.chars().count()).sum::<usize>() + separators
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let mut excerpt: String = text.chars().take(limit).collect();
        excerpt.push_str("...");
        excerpt
    }
}
