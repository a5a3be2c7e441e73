//! Tool host boundary.
//!
//! The host owns the actual tools (filesystem, shell, search, sub-tasks) and
//! a little environment knowledge the safety gate needs for previews.  The
//! agent loop calls it uniformly through [`AgentHost`].

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{ToolCall, ToolDefinition, ToolResult};
use crate::safety::Mode;

/// How a tool execution failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolFailure {
    /// The tool ran and reported an error.  This is fed back to the model as
    /// an observation.
    #[error("{0}")]
    Failed(String),

    /// The host could not honour its contract (e.g. it lost track of the tool
    /// process).  This ends the turn with [`AgentError::ToolError`].
    #[error("executor contract violated: {0}")]
    ContractViolation(String),
}

/// Environment the agent loop runs against.
#[async_trait]
pub trait AgentHost: Send + Sync {
    /// Tool definitions exposed to the model.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a named tool with the given arguments.
    ///
    /// Must not panic; every failure is a [`ToolFailure`].
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Value,
    ) -> std::result::Result<String, ToolFailure>;

    /// Directory commands run in, shown in command previews.
    fn working_dir(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Current contents of `path`, used as the `before` side of file diff
    /// previews.  `None` when the file does not exist or cannot be read.
    async fn read_file(&self, _path: &str) -> Option<String> {
        None
    }

    /// Expand the raw user text before it enters history (file mentions,
    /// mode hints and so on).
    fn augment_user_message(&self, text: &str, _mode: Mode) -> String {
        text.to_owned()
    }
}

/// Run one tool call through the host.
///
/// Ordinary failures become an error observation.  A panic or an explicit
/// contract violation becomes [`AgentError::ToolError`].
pub(crate) async fn execute_call(host: &dyn AgentHost, call: &ToolCall) -> Result<ToolResult> {
    let outcome = AssertUnwindSafe(host.execute(&call.name, &call.arguments))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(output)) => Ok(ToolResult::ok(call, output)),
        Ok(Err(ToolFailure::Failed(reason))) => {
            tracing::warn!(
                tool = %call.name,
                id = %call.id,
                error = %reason,
                "tool execution failed"
            );
            Ok(ToolResult::failed(call, reason))
        }
        Ok(Err(ToolFailure::ContractViolation(reason))) => Err(AgentError::ToolError {
            tool: call.name.clone(),
            message: reason,
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "tool panicked".to_owned());
            tracing::warn!(tool = %call.name, id = %call.id, %message, "tool execution panicked");
            Err(AgentError::ToolError {
                tool: call.name.clone(),
                message,
            })
        }
    }
}
