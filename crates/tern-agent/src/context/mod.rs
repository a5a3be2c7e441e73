//! Context budget management.
//!
//! - [`tokens`] -- Character-based token estimation.
//! - [`manager`] -- Usage statistics, compaction levels and summarizing
//!   compaction.

pub mod manager;
pub mod tokens;

pub use manager::{CompactionLevel, CompactionResult, ContextManager, ContextStats, RoleTokens};
pub use tokens::{estimate_message_tokens, estimate_tokens};
