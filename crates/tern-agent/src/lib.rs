//! Agent orchestration core for tern.
//!
//! This crate turns one user message into a bounded sequence of
//! reasoning/tool-use/observation steps, gates risky tool calls behind a
//! safety policy with human confirmation, and keeps the conversation within
//! the model's context budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌────────────┐
//! │ ModelClient │<────│  Agent loop │────>│ SafetyGate │──> UI (tickets)
//! │  (stream)   │     │  (runtime)  │     │ (risk/pol) │
//! └─────────────┘     └──────┬──────┘     └────────────┘
//!                            │
//!                     ┌──────┴──────┐     ┌────────────────┐
//!                     │  AgentHost  │     │ ContextManager │ (between turns)
//!                     │   (tools)   │     │  (compaction)  │
//!                     └─────────────┘     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- Conversation types and the model client boundary.
//! - [`host`] -- The tool host boundary.
//! - [`safety`] -- Risk classification, confirmation and policy memory.
//! - [`loop_detector`] -- Repeated-action detection.
//! - [`runtime`] -- The agent loop.
//! - [`context`] -- Token accounting and history compaction.
//! - [`session`] -- Caller-side session driver and interrupt debounce.
//! - [`config`] -- TOML configuration with environment overrides.
//! - [`error`] -- Agent error types.

pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod llm;
pub mod loop_detector;
pub mod runtime;
pub mod safety;
pub mod session;

// Re-export the most commonly used types at the crate root.
pub use config::{AgentConfig, ContextConfig, LoopConfig, LoopDetectionConfig};
pub use context::{CompactionLevel, CompactionResult, ContextManager, ContextStats, RoleTokens};
pub use error::{AgentError, ConfigError, Result};
pub use host::{AgentHost, ToolFailure};
pub use llm::{
    Message, ModelClient, ModelEvent, ModelRequest, ModelStream, ModelTurn, Role, ToolCall,
    ToolDefinition, ToolResult, TurnAccumulator,
};
pub use loop_detector::{CallSignature, LoopDetector};
pub use runtime::{
    Agent, AgentCallbacks, AgentResult, AgentStep, DeniedCall, NoopCallbacks, RunContext,
};
pub use safety::{
    Authorization, ConfirmationAction, ConfirmationRequest, ConfirmationResponse,
    ConfirmationTicket, GateDecision, Mode, Preview, RiskLevel, RiskTable, SafetyGate, ToolPolicy,
    ToolPolicyMemory, ToolRule,
};
pub use session::{InterruptGuard, InterruptOutcome, Session};

/// Cancellation token accepted by [`RunContext`].
pub use tokio_util::sync::CancellationToken;
