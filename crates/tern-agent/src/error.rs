//! Agent error types.
//!
//! Every way an agent invocation can end without a final answer is an
//! [`AgentError`] variant.  None of them is raised as a panic across the loop
//! boundary; the caller matches on the variant and maps it to a status line.
//!
//! Configuration problems are kept separate in [`ConfigError`] because they
//! happen before any invocation starts.

use std::path::PathBuf;

/// Terminal failure of a single agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The caller cancelled the run.  No partial result is produced.
    #[error("agent run aborted")]
    Aborted,

    /// The model client failed or produced an unusable response.
    #[error("model error: {message}")]
    ModelError { message: String },

    /// The iteration cap was hit before the model produced a final answer.
    #[error("agent exceeded max iterations ({iterations})")]
    MaxIterations {
        iterations: u32,
        /// Most recent reasoning text, untruncated.
        last_thought: String,
    },

    /// The model kept requesting the same action.
    #[error("loop detected: `{action}` requested {attempts} times")]
    LoopDetected { action: String, attempts: u32 },

    /// The tool host broke its contract (panicked or reported a fault that
    /// cannot be fed back to the model).
    #[error("tool `{tool}` failed fatally: {message}")]
    ToolError { tool: String, message: String },
}

impl AgentError {
    /// Build a [`AgentError::ModelError`] from anything displayable.
    pub fn model(message: impl Into<String>) -> Self {
        Self::ModelError {
            message: message.into(),
        }
    }

    /// Stable snake_case tag for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::ModelError { .. } => "model_error",
            Self::MaxIterations { .. } => "max_iterations",
            Self::LoopDetected { .. } => "loop_detected",
            Self::ToolError { .. } => "tool_error",
        }
    }

    /// Whether the session can simply carry on with the next user message.
    ///
    /// Only cancellation is recoverable; everything else ends the turn with a
    /// diagnostic.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Failure while loading or validating [`crate::config::AgentConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration text is not valid TOML for the expected schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was parsed but is out of range.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}
