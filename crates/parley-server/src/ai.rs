//! The AI reply collaborator.
//!
//! The router calls [`ReplyGenerator`] out-of-band, after the triggering
//! human message has already been delivered, and always under
//! `tokio::time::timeout`. A slow or failing generator can therefore
//! never delay or fail a user's message.

use futures::future::BoxFuture;
use futures::FutureExt;

use parley_store::StoredMessage;

/// Username reserved for the AI participant. Created at startup with an
/// unusable password hash, so nobody can log in as it.
pub const AI_USERNAME: &str = "assistant";

/// External text-completion collaborator.
pub trait ReplyGenerator: Send + Sync {
    /// Produce a reply for `prompt`, given recent group context.
    fn generate_reply<'a>(
        &'a self,
        prompt: &'a str,
        context: &'a [StoredMessage],
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// If `content` addresses the AI participant, return the prompt text.
///
/// Trigger form: the message starts with `@ai` (case-insensitive),
/// optionally followed by the prompt.
pub fn ai_trigger(content: &str) -> Option<&str> {
    let trimmed = content.trim_start();
    if trimmed.len() < 3 || !trimmed.is_char_boundary(3) {
        return None;
    }
    let (head, rest) = trimmed.split_at(3);
    if !head.eq_ignore_ascii_case("@ai") {
        return None;
    }
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c.is_whitespace() => Some(rest.trim()),
        _ => None,
    }
}

/// Offline stand-in generator. Real deployments wire an actual completion
/// service here; tests substitute mocks.
#[derive(Debug, Default)]
pub struct CannedReplyGenerator;

impl ReplyGenerator for CannedReplyGenerator {
    fn generate_reply<'a>(
        &'a self,
        prompt: &'a str,
        _context: &'a [StoredMessage],
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            if prompt.is_empty() {
                Ok("Hello! Ask me something after the @ai mention.".to_string())
            } else {
                Ok(format!("I heard you ask about \"{prompt}\", but no reply service is configured."))
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_detection() {
        assert_eq!(ai_trigger("@ai what is rust"), Some("what is rust"));
        assert_eq!(ai_trigger("@AI what is rust"), Some("what is rust"));
        assert_eq!(ai_trigger("  @ai hello"), Some("hello"));
        assert_eq!(ai_trigger("@ai"), Some(""));
        assert_eq!(ai_trigger("@ai\thello"), Some("hello"));

        assert_eq!(ai_trigger("hello @ai"), None);
        assert_eq!(ai_trigger("@aint a trigger"), None);
        assert_eq!(ai_trigger("plain message"), None);
        assert_eq!(ai_trigger(""), None);
    }

    #[tokio::test]
    async fn canned_generator_replies() {
        let generator = CannedReplyGenerator;
        let reply = generator.generate_reply("ping", &[]).await.unwrap();
        assert!(reply.contains("ping"));
    }
}
