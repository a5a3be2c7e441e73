//! Model client boundary.
//!
//! The agent never talks HTTP.  It hands a [`ModelRequest`] to a
//! [`ModelClient`] and consumes the returned [`ModelStream`]: zero or more
//! reasoning fragments followed by tool calls or a final answer.  Dropping the
//! stream is how the loop cancels a response mid-flight, so implementations
//! must release their resources on drop.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{AgentError, Result};
use crate::llm::types::{Message, ToolCall, ToolDefinition};

/// A single request to the model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    /// The conversation history, oldest first.
    pub messages: &'a [Message],

    /// Tool definitions the model may invoke.  Empty for summarization.
    pub tools: &'a [ToolDefinition],

    /// Optional cap on the number of generated tokens.
    pub max_tokens: Option<u32>,
}

/// One event of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A fragment of reasoning text.
    Reasoning(String),

    /// One or more tool calls.  May be emitted more than once; the calls
    /// accumulate in order.
    ToolCalls(Vec<ToolCall>),

    /// The final textual answer.
    FinalAnswer(String),
}

/// A streamed model response.
pub type ModelStream = BoxStream<'static, Result<ModelEvent>>;

/// Something that can produce model responses.
///
/// Retry policy, authentication and wire formats live behind this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start a response for `request`.
    ///
    /// Errors returned here, or yielded by the stream, end the current turn
    /// with [`AgentError::ModelError`].
    async fn send(&self, request: ModelRequest<'_>) -> Result<ModelStream>;
}

/// A fully received model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    /// The model wants tools executed before continuing.
    ToolCalls {
        reasoning: String,
        calls: Vec<ToolCall>,
    },

    /// The model is done.
    Final { reasoning: String, answer: String },
}

/// Folds [`ModelEvent`]s into a [`ModelTurn`].
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    reasoning: String,
    calls: Vec<ToolCall>,
    answer: Option<String>,
}

impl TurnAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event.
    pub fn push(&mut self, event: ModelEvent) {
        match event {
            ModelEvent::Reasoning(text) => self.reasoning.push_str(&text),
            ModelEvent::ToolCalls(calls) => self.calls.extend(calls),
            ModelEvent::FinalAnswer(text) => match &mut self.answer {
                Some(answer) => answer.push_str(&text),
                None => self.answer = Some(text),
            },
        }
    }

    /// Finish the response.
    ///
    /// Tool calls win over a final answer: a response that asks for tools is
    /// not finished yet.  A stream that produced neither is malformed.
    pub fn finish(self) -> Result<ModelTurn> {
        if !self.calls.is_empty() {
            return Ok(ModelTurn::ToolCalls {
                reasoning: self.reasoning,
                calls: self.calls,
            });
        }
        match self.answer {
            Some(answer) => Ok(ModelTurn::Final {
                reasoning: self.reasoning,
                answer,
            }),
            None => Err(AgentError::model(
                "model stream ended without tool calls or a final answer",
            )),
        }
    }
}

/// Normalise an error coming out of a model client.
///
/// Cancellation observed by the client stays [`AgentError::Aborted`];
/// anything else becomes a [`AgentError::ModelError`].
pub(crate) fn into_model_error(err: AgentError) -> AgentError {
    match err {
        AgentError::Aborted | AgentError::ModelError { .. } => err,
        other => AgentError::model(other.to_string()),
    }
}
