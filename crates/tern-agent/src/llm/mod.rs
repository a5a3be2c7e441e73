//! Model integration layer.
//!
//! - [`types`] -- Conversation data types (messages, tool calls, results).
//! - [`model`] -- The [`ModelClient`] trait and streamed response events.

pub mod model;
pub mod types;

pub use model::{ModelClient, ModelEvent, ModelRequest, ModelStream, ModelTurn, TurnAccumulator};
pub use types::{Message, Role, ToolCall, ToolDefinition, ToolResult};
