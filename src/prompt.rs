//! Prompt rendering for the fine-tuned instruction template
//!
//! The literal structure of these templates is an external contract: the
//! model was tuned against exactly this byte sequence, and a mismatched
//! template measurably degrades output quality. Section labels, newlines
//! and ordering must not change.

/// Marker opening the instruction section
pub const INSTRUCTION_MARKER: &str = "### Instruction:";

/// Marker opening the response section. Also used by output cleanup to
/// strip echoed scaffolding from raw model output.
pub const RESPONSE_MARKER: &str = "### Response:";

/// Fallback topic label when a follow-up arrives with no inferred topic
pub const UNKNOWN_TOPIC_LABEL: &str = "the previous topic";

/// Render a standalone question into the two-section training template.
///
/// Total over any string input, including empty; validation happens
/// upstream.
pub fn render(user_text: &str) -> String {
    format!("{INSTRUCTION_MARKER}\n{}\n\n{RESPONSE_MARKER}\n", user_text.trim())
}

/// Render a follow-up question with a prior-conversation section.
///
/// `context_block` holds verbatim prior turns, oldest first, assembled by
/// the context builder. `topic_label` names the subject being continued.
pub fn render_with_context(user_text: &str, topic_label: &str, context_block: &str) -> String {
    format!(
        "{INSTRUCTION_MARKER}\n\
         You are continuing a conversation about {topic_label}. \
         The user is asking for a follow-up response related to this topic.\n\n\
         Recent conversation:\n{context_block}\n\n\
         User's follow-up request: {}\n\n\
         Please provide a response about {topic_label} that addresses their request.\n\n\
         {RESPONSE_MARKER}\n",
        user_text.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_matches_training_template() {
        let prompt = render("Explain vector addition");
        assert_eq!(
            prompt,
            "### Instruction:\nExplain vector addition\n\n### Response:\n"
        );
    }

    #[test]
    fn test_render_contains_message_verbatim_with_empty_response_section() {
        let message = "What is Newton's second law?";
        let prompt = render(message);

        let instruction_section = prompt
            .split(RESPONSE_MARKER)
            .next()
            .expect("instruction section");
        assert!(instruction_section.contains(message));

        let response_section = prompt
            .rsplit(RESPONSE_MARKER)
            .next()
            .expect("response section");
        assert_eq!(response_section, "\n");
    }

    #[test]
    fn test_render_trims_input() {
        let prompt = render("  spaced out  ");
        assert_eq!(prompt, "### Instruction:\nspaced out\n\n### Response:\n");
    }

    #[test]
    fn test_render_total_on_empty_input() {
        let prompt = render("");
        assert!(prompt.starts_with(INSTRUCTION_MARKER));
        assert!(prompt.ends_with("### Response:\n"));
    }

    #[test]
    fn test_render_with_context_layout() {
        let block = "User asked: Explain vector addition\nAssistant explained: Vectors add tip to tail.";
        let prompt = render_with_context("give me an analogy", "vector addition", block);

        assert!(prompt.starts_with("### Instruction:\n"));
        assert!(prompt.contains("continuing a conversation about vector addition"));
        assert!(prompt.contains("Recent conversation:\nUser asked: Explain vector addition"));
        assert!(prompt.contains("User's follow-up request: give me an analogy"));
        assert!(prompt.ends_with("### Response:\n"));

        // Context precedes the follow-up request, which precedes the
        // response marker.
        let context_at = prompt.find("Recent conversation:").unwrap();
        let request_at = prompt.find("User's follow-up request:").unwrap();
        let response_at = prompt.find(RESPONSE_MARKER).unwrap();
        assert!(context_at < request_at);
        assert!(request_at < response_at);
    }
}
