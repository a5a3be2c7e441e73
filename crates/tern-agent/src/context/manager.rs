//! Context budget tracking and history compaction.
//!
//! When usage crosses the configured thresholds the older part of the
//! conversation is summarized by the model and replaced with one message:
//!
//! 1. The leading system prompt (if any) is kept as is.
//! 2. The most recent `K` messages are kept verbatim (`K` shrinks as the
//!    compaction level rises).
//! 3. Everything in between becomes `[Conversation summary of N earlier
//!    messages]` followed by the model's summary.

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info};

use super::tokens::{
    CHARS_PER_TOKEN, MESSAGE_OVERHEAD_TOKENS, estimate_history_tokens, estimate_message_tokens,
};
use crate::config::ContextConfig;
use crate::error::{AgentError, Result};
use crate::llm::model::{
    ModelClient, ModelRequest, ModelTurn, TurnAccumulator, into_model_error,
};
use crate::llm::types::{Message, Role};

/// Fewer eligible messages than this are not worth a summarization call.
const MIN_SUMMARIZED_MESSAGES: usize = 2;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Estimated tokens per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleTokens {
    pub system: usize,
    pub user: usize,
    pub assistant: usize,
    pub tool: usize,
}

impl RoleTokens {
    fn add(&mut self, role: Role, tokens: usize) {
        match role {
            Role::System => self.system += tokens,
            Role::User => self.user += tokens,
            Role::Assistant => self.assistant += tokens,
            Role::Tool => self.tool += tokens,
        }
    }
}

/// Snapshot of context usage.  Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextStats {
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub usage_percent: f64,
    pub by_role: RoleTokens,
    pub is_near_limit: bool,
    pub is_critical: bool,
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// How hard to compact.  Ordered from least to most aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionLevel {
    None,
    Light,
    Moderate,
    Aggressive,
}

/// Outcome of [`ContextManager::compact`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub messages: Vec<Message>,
    pub original_count: usize,
    pub compacted_count: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompactionResult {
    fn unchanged(history: &[Message], tokens: usize) -> Self {
        Self {
            messages: history.to_vec(),
            original_count: history.len(),
            compacted_count: history.len(),
            tokens_before: tokens,
            tokens_after: tokens,
        }
    }

    /// Whether anything was summarized.
    pub fn is_compacted(&self) -> bool {
        self.compacted_count < self.original_count
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Computes usage and performs compaction according to a [`ContextConfig`].
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Usage of `history` against the configured budget.
    pub fn stats(&self, history: &[Message]) -> ContextStats {
        self.compute_stats(history, self.config.max_tokens)
    }

    /// Usage of `history` against an explicit budget of `max_tokens`.
    pub fn compute_stats(&self, history: &[Message], max_tokens: usize) -> ContextStats {
        let mut by_role = RoleTokens::default();
        let mut total_tokens = 0;
        for message in history {
            let tokens = estimate_message_tokens(message);
            by_role.add(message.role, tokens);
            total_tokens += tokens;
        }

        let usage_percent = if max_tokens == 0 {
            if total_tokens == 0 { 0.0 } else { 100.0 }
        } else {
            total_tokens as f64 / max_tokens as f64 * 100.0
        };

        ContextStats {
            total_tokens,
            max_tokens,
            usage_percent,
            by_role,
            is_near_limit: usage_percent >= self.config.near_limit_percent,
            is_critical: usage_percent >= self.config.critical_percent,
        }
    }

    /// Level warranted by `usage_percent`.
    pub fn compaction_level_for(&self, usage_percent: f64) -> CompactionLevel {
        let c = &self.config;
        if usage_percent < c.near_limit_percent {
            CompactionLevel::None
        } else if usage_percent < c.moderate_percent {
            CompactionLevel::Light
        } else if usage_percent < c.critical_percent {
            CompactionLevel::Moderate
        } else {
            CompactionLevel::Aggressive
        }
    }

    /// Messages kept verbatim at `level`.  `None` keeps everything.
    pub fn keep_recent(&self, level: CompactionLevel) -> usize {
        match level {
            CompactionLevel::None => usize::MAX,
            CompactionLevel::Light => self.config.keep_recent_light,
            CompactionLevel::Moderate => self.config.keep_recent_moderate,
            CompactionLevel::Aggressive => self.config.keep_recent_aggressive,
        }
    }

    /// Compact `history` at `level`, summarizing with `model`.
    ///
    /// Empty or short histories, and [`CompactionLevel::None`], come back
    /// unchanged without calling the model.  The system prompt and the most
    /// recent user message are always kept.
    ///
    /// # Errors
    ///
    /// [`AgentError::ModelError`] if the summarization request fails.
    pub async fn compact(
        &self,
        history: &[Message],
        level: CompactionLevel,
        model: &dyn ModelClient,
    ) -> Result<CompactionResult> {
        let tokens_before = estimate_history_tokens(history);
        if history.is_empty() || level == CompactionLevel::None {
            return Ok(CompactionResult::unchanged(history, tokens_before));
        }

        let (system_prompt, conversation) = match history.first() {
            Some(first) if first.role == Role::System => (Some(first), &history[1..]),
            _ => (None, history),
        };

        let split = split_point(conversation, self.keep_recent(level));
        if split < MIN_SUMMARIZED_MESSAGES {
            debug!(
                total = history.len(),
                level = ?level,
                "not enough messages to compact, returning as-is"
            );
            return Ok(CompactionResult::unchanged(history, tokens_before));
        }

        let old_messages = &conversation[..split];
        let recent_messages = &conversation[split..];
        info!(
            level = ?level,
            old_count = old_messages.len(),
            recent_count = recent_messages.len(),
            "compacting conversation history"
        );

        let transcript = format_messages_for_summary(old_messages);
        let summary =
            summarize_conversation(&transcript, model, self.config.summary_max_tokens).await?;
        let summary_message = summary_message(old_messages, &summary);

        let mut messages = Vec::with_capacity(2 + recent_messages.len());
        if let Some(system) = system_prompt {
            messages.push(system.clone());
        }
        messages.push(summary_message);
        messages.extend_from_slice(recent_messages);

        let tokens_after = estimate_history_tokens(&messages);
        info!(
            original = history.len(),
            compacted = messages.len(),
            tokens_before,
            tokens_after,
            "compaction complete"
        );

        Ok(CompactionResult {
            original_count: history.len(),
            compacted_count: messages.len(),
            messages,
            tokens_before,
            tokens_after,
        })
    }

    /// Compact only if the configured budget calls for it.
    pub async fn compact_if_needed(
        &self,
        history: &[Message],
        model: &dyn ModelClient,
    ) -> Result<Option<CompactionResult>> {
        let stats = self.stats(history);
        let level = self.compaction_level_for(stats.usage_percent);
        if level == CompactionLevel::None {
            return Ok(None);
        }
        let result = self.compact(history, level, model).await?;
        Ok(result.is_compacted().then_some(result))
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Index splitting `conversation` into summarized and verbatim parts.
///
/// The verbatim tail holds at least `keep_recent` messages, the last user
/// message, and never starts with a tool result cut off from its request.
fn split_point(conversation: &[Message], keep_recent: usize) -> usize {
    let mut split = conversation.len().saturating_sub(keep_recent);
    if let Some(last_user) = conversation.iter().rposition(|m| m.role == Role::User) {
        split = split.min(last_user);
    }
    while split > 0 && split < conversation.len() && conversation[split].role == Role::Tool {
        split -= 1;
    }
    split
}

/// Build the summary message, clipped to cost no more than what it replaces.
fn summary_message(replaced: &[Message], summary: &str) -> Message {
    let mut content = format!(
        "[Conversation summary of {count} earlier messages]\n{summary}",
        count = replaced.len(),
    );

    let budget = estimate_history_tokens(replaced).saturating_sub(MESSAGE_OVERHEAD_TOKENS);
    let max_chars = budget * CHARS_PER_TOKEN;
    if let Some((idx, _)) = content.char_indices().nth(max_chars) {
        debug!(max_chars, "clipping conversation summary");
        content.truncate(idx);
    }
    Message::system(content)
}

/// Render messages as a plain transcript for the summarizer.
fn format_messages_for_summary(messages: &[Message]) -> String {
    let mut buf = String::with_capacity(messages.len() * 200);
    for msg in messages {
        buf.push_str(msg.role.label());
        buf.push_str(": ");
        buf.push_str(&msg.content);
        for tc in &msg.tool_calls {
            buf.push_str(&format!("\n  [tool_call: {}({})]", tc.name, tc.arguments));
        }
        buf.push('\n');
    }
    buf
}

/// Ask the model for a summary of `transcript`.
async fn summarize_conversation(
    transcript: &str,
    model: &dyn ModelClient,
    max_tokens: u32,
) -> Result<String> {
    let prompt = format!(
        "Summarize the following conversation concisely, preserving key facts, decisions, \
         tool results, and context needed to continue the conversation. Be factual and brief.\n\n\
         {transcript}"
    );
    let messages = [Message::user(prompt)];
    let request = ModelRequest {
        messages: &messages,
        tools: &[],
        max_tokens: Some(max_tokens),
    };

    debug!(transcript_len = transcript.len(), "requesting conversation summary");

    let mut stream = model.send(request).await.map_err(into_model_error)?;
    let mut acc = TurnAccumulator::new();
    while let Some(event) = stream.next().await {
        acc.push(event.map_err(into_model_error)?);
    }

    match acc.finish()? {
        ModelTurn::Final { answer, .. } => {
            debug!(summary_len = answer.len(), "received conversation summary");
            Ok(answer)
        }
        ModelTurn::ToolCalls { .. } => Err(AgentError::model(
            "summarization request unexpectedly returned tool calls instead of text",
        )),
    }
}
