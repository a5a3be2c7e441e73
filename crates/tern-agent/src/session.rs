//! Caller-side session driver.
//!
//! A [`Session`] owns what outlives a single agent run: the history, the
//! remembered tool policies and the current mode.  It hands the loop a fresh
//! [`RunContext`] per turn and keeps the history bounded between turns.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{CompactionResult, ContextManager, ContextStats};
use crate::error::Result;
use crate::host::AgentHost;
use crate::llm::model::ModelClient;
use crate::llm::types::Message;
use crate::runtime::{Agent, AgentCallbacks, AgentResult, RunContext};
use crate::safety::{Mode, ToolPolicyMemory};

/// Window in which a second interrupt cancels the run.
pub const DEFAULT_INTERRUPT_WINDOW: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A conversation with its tool policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub mode: Mode,
    pub messages: Vec<Message>,
    pub policy: ToolPolicyMemory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create an empty session in build mode.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            mode: Mode::default(),
            messages: Vec::new(),
            policy: ToolPolicyMemory::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Start the history with a system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(0, Message::system(prompt));
        self
    }

    /// Switch between plan and build mode.
    pub fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            info!(session = %self.id, from = %self.mode, to = %mode, "session mode changed");
            self.mode = mode;
            self.updated_at = Utc::now();
        }
    }

    /// Run one user turn.
    ///
    /// The loop grows the session history in place.  On failure the history
    /// keeps the user message and every completed tool exchange, so the next
    /// turn still sees side effects that already happened.  Policies
    /// remembered during a failed run are kept too.
    pub async fn run_turn(
        &mut self,
        agent: &Agent,
        model: &dyn ModelClient,
        host: &dyn AgentHost,
        user_message: &str,
        cancel: &CancellationToken,
        callbacks: &dyn AgentCallbacks,
    ) -> Result<AgentResult> {
        let ctx = RunContext {
            model,
            host,
            mode: self.mode,
            policy: &mut self.policy,
            cancel,
            callbacks,
        };
        let outcome = agent.run_in(ctx, user_message, &mut self.messages).await;
        self.updated_at = Utc::now();
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    session = %self.id,
                    kind = err.kind(),
                    messages = self.messages.len(),
                    "turn failed, partial history kept"
                );
                return Err(err);
            }
        };

        debug!(
            session = %self.id,
            messages = self.messages.len(),
            steps = result.steps.len(),
            "turn recorded"
        );
        Ok(result)
    }

    /// Current context usage.
    pub fn stats(&self, manager: &ContextManager) -> ContextStats {
        manager.stats(&self.messages)
    }

    /// Compact the history if usage calls for it.
    pub async fn compact_if_needed(
        &mut self,
        manager: &ContextManager,
        model: &dyn ModelClient,
    ) -> Result<Option<CompactionResult>> {
        let Some(result) = manager.compact_if_needed(&self.messages, model).await? else {
            return Ok(None);
        };
        self.messages.clone_from(&result.messages);
        self.updated_at = Utc::now();
        Ok(Some(result))
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// What an interrupt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// First press; another one within the window cancels.
    Armed,
    /// The run was cancelled.
    Cancelled,
    /// The token was already cancelled.
    AlreadyCancelled,
}

/// Double-press debounce in front of a [`CancellationToken`].
#[derive(Debug, Clone)]
pub struct InterruptGuard {
    cancel: CancellationToken,
    window: Duration,
    armed_at: Option<Instant>,
}

impl InterruptGuard {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_window(cancel, DEFAULT_INTERRUPT_WINDOW)
    }

    pub fn with_window(cancel: CancellationToken, window: Duration) -> Self {
        Self {
            cancel,
            window,
            armed_at: None,
        }
    }

    /// The guarded token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register an interrupt now.
    pub fn interrupt(&mut self) -> InterruptOutcome {
        self.interrupt_at(Instant::now())
    }

    /// Register an interrupt observed at `now`.
    pub fn interrupt_at(&mut self, now: Instant) -> InterruptOutcome {
        if self.cancel.is_cancelled() {
            return InterruptOutcome::AlreadyCancelled;
        }

        match self.armed_at {
            Some(at) if now.saturating_duration_since(at) <= self.window => {
                info!("second interrupt, cancelling agent run");
                self.armed_at = None;
                self.cancel.cancel();
                InterruptOutcome::Cancelled
            }
            _ => {
                debug!(window_ms = self.window.as_millis() as u64, "interrupt armed");
                self.armed_at = Some(now);
                InterruptOutcome::Armed
            }
        }
    }

    /// Whether a second interrupt at `now` would cancel.
    pub fn is_armed(&self, now: Instant) -> bool {
        self.armed_at
            .is_some_and(|at| now.saturating_duration_since(at) <= self.window)
    }

    /// Forget a pending first interrupt.
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }
}
