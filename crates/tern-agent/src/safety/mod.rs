//! Tool-call safety policy.
//!
//! - [`risk`] -- Data-driven risk classification and session [`Mode`].
//! - [`gate`] -- The [`SafetyGate`], confirmation tickets and per-session
//!   policy memory.

pub mod gate;
pub mod risk;

pub use gate::{
    Authorization, ConfirmationAction, ConfirmationRequest, ConfirmationResponse,
    ConfirmationTicket, DENIED_BY_POLICY, DENIED_BY_USER, DENIED_UNANSWERED, GateDecision,
    Preview, SafetyGate, ToolPolicy, ToolPolicyMemory,
};
pub use risk::{Mode, PreviewKind, RiskLevel, RiskTable, ToolRule};
