//! Approximate token accounting.
//!
//! Estimates are character based and computed per message, independently of
//! the surrounding conversation, so totals are plain sums.

use crate::llm::types::Message;

/// Characters assumed per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message cost for role markers and framing.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimated tokens for a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimated tokens for one message, tool calls included.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments.to_string()))
        .sum();
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&message.content) + calls
}

/// Estimated tokens for a whole history.
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
