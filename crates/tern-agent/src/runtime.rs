//! The agent loop.
//!
//! One call to [`Agent::run`] turns one user message into a bounded sequence
//! of iterations:
//!
//! ```text
//!   Reasoning ──> Acting ──> Observing ──┐
//!      ▲                                 │
//!      └─────────────────────────────────┘
//!      │
//!      ├──> Done    (final answer, no tool calls)
//!      └──> Failed  (any AgentError)
//! ```
//!
//! Each iteration streams one model response, then runs the requested tool
//! calls sequentially, in request order, through the [`SafetyGate`] and the
//! [`AgentHost`].  Observations are appended to history before the next model
//! call.  Cancellation is checked before and after every suspension point
//! (model response, confirmation wait, tool execution).

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::host::{AgentHost, execute_call};
use crate::llm::model::{
    ModelClient, ModelEvent, ModelRequest, ModelTurn, TurnAccumulator, into_model_error,
};
use crate::llm::types::{Message, Role, ToolCall, ToolResult};
use crate::loop_detector::LoopDetector;
use crate::safety::{
    Authorization, ConfirmationTicket, DENIED_BY_POLICY, Mode, SafetyGate, ToolPolicyMemory,
};

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Observer of a running loop.
///
/// Every method has a no-op default.  Only
/// [`on_confirmation_needed`](Self::on_confirmation_needed) influences control
/// flow: the loop waits until the ticket is answered, dropped, or the run is
/// cancelled.
pub trait AgentCallbacks: Send + Sync {
    /// A fragment of streamed reasoning text.
    fn on_reasoning_token(&self, _text: &str) {}

    /// A tool call is about to go through the safety gate.
    fn on_tool_call(&self, _call: &ToolCall) {}

    /// A tool finished executing.
    fn on_tool_result(&self, _result: &ToolResult) {}

    /// An iteration finished.
    fn on_step_complete(&self, _step: &AgentStep) {}

    /// A call needs a human decision.  Answer through
    /// [`ConfirmationTicket::respond`], now or later from another task.
    /// Dropping the ticket denies the call.
    fn on_confirmation_needed(&self, ticket: ConfirmationTicket) {
        drop(ticket);
    }

    /// The gate vetoed a call from a remembered or configured policy,
    /// without asking.  Calls the user denies are reported through the
    /// ticket's answer instead.
    fn on_tool_blocked(&self, _tool: &str, _reason: &str) {}
}

/// Callbacks that ignore everything.  Confirmations are denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallbacks;

impl AgentCallbacks for NoopCallbacks {}

static NOOP_CALLBACKS: NoopCallbacks = NoopCallbacks;

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Everything one invocation borrows from its caller.
pub struct RunContext<'a> {
    pub model: &'a dyn ModelClient,
    pub host: &'a dyn AgentHost,
    pub mode: Mode,
    pub policy: &'a mut ToolPolicyMemory,
    pub cancel: &'a CancellationToken,
    pub callbacks: &'a dyn AgentCallbacks,
}

impl<'a> RunContext<'a> {
    /// Context in build mode with no-op callbacks.
    pub fn new(
        model: &'a dyn ModelClient,
        host: &'a dyn AgentHost,
        policy: &'a mut ToolPolicyMemory,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            model,
            host,
            mode: Mode::default(),
            policy,
            cancel,
            callbacks: &NOOP_CALLBACKS,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_callbacks(mut self, callbacks: &'a dyn AgentCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A call the safety gate refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeniedCall {
    pub call_id: String,
    pub tool: String,
    pub reason: String,
}

/// Record of one iteration.
///
/// `observations` holds one result per call in `actions` that was not
/// denied, in the same order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStep {
    /// Zero-based iteration index.
    pub iteration: u32,
    pub actions: Vec<ToolCall>,
    pub observations: Vec<ToolResult>,
    pub denied: Vec<DeniedCall>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AgentStep {
    fn begin(iteration: u32) -> Self {
        let now = Utc::now();
        Self {
            iteration,
            actions: Vec::new(),
            observations: Vec::new(),
            denied: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Successful outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub run_id: Uuid,
    pub final_answer: String,
    /// The full updated history, including the user message and the final
    /// answer.
    pub messages: Vec<Message>,
    pub steps: Vec<AgentStep>,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Drives the reasoning/tool loop.
#[derive(Debug, Clone, Default)]
pub struct Agent {
    config: AgentConfig,
    gate: SafetyGate,
}

impl Agent {
    /// Create an agent with the default risk table.
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            gate: SafetyGate::default(),
        }
    }

    /// Replace the safety gate.
    pub fn with_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    /// Run the loop for `user_message` on top of `history`.
    ///
    /// # Errors
    ///
    /// Any [`AgentError`].  The history built up to the failure is dropped;
    /// use [`run_in`](Self::run_in) to keep it.
    pub async fn run(
        &self,
        ctx: RunContext<'_>,
        user_message: &str,
        history: Vec<Message>,
    ) -> Result<AgentResult> {
        let mut messages = history;
        self.run_in(ctx, user_message, &mut messages).await
    }

    /// Run the loop, growing `history` in place.
    ///
    /// On success `history` ends with the final answer and equals
    /// [`AgentResult::messages`].  On failure it keeps every message appended
    /// before the error, including observations of tools that already ran.
    /// An assistant tool-call message left without replies is removed, and
    /// one left with some replies gets a failed reply for each call that
    /// never ran, so the history stays well formed for the next turn.
    ///
    /// # Errors
    ///
    /// Any [`AgentError`].
    pub async fn run_in(
        &self,
        ctx: RunContext<'_>,
        user_message: &str,
        history: &mut Vec<Message>,
    ) -> Result<AgentResult> {
        let run_id = Uuid::now_v7();
        let span = tracing::info_span!("agent_run", run_id = %run_id, mode = %ctx.mode);
        match self
            .drive(ctx, user_message, history)
            .instrument(span)
            .await
        {
            Ok((final_answer, steps)) => Ok(AgentResult {
                run_id,
                final_answer,
                messages: history.clone(),
                steps,
            }),
            Err(err) => {
                close_unanswered_calls(history, &err);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        ctx: RunContext<'_>,
        user_message: &str,
        messages: &mut Vec<Message>,
    ) -> Result<(String, Vec<AgentStep>)> {
        let RunContext {
            model,
            host,
            mode,
            policy,
            cancel,
            callbacks,
        } = ctx;

        let tools = host.tool_definitions();
        let max_iterations = self.config.agent.max_iterations;
        let mut detector = LoopDetector::new(&self.config.loop_detection);
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut last_thought = String::new();

        messages.push(Message::user(host.augment_user_message(user_message, mode)));

        info!(
            max_iterations,
            tool_count = tools.len(),
            history_len = messages.len(),
            "starting agent loop"
        );

        let mut iteration: u32 = 0;
        loop {
            if iteration >= max_iterations {
                warn!(iterations = max_iterations, "iteration cap reached");
                return Err(AgentError::MaxIterations {
                    iterations: max_iterations,
                    last_thought,
                });
            }
            check_cancel(cancel)?;
            debug!(iteration, "iteration start");

            let mut step = AgentStep::begin(iteration);
            let request = ModelRequest {
                messages: messages.as_slice(),
                tools: &tools,
                max_tokens: self.config.agent.max_response_tokens,
            };

            let turn = receive_turn(model, request, cancel, callbacks).await?;
            let (reasoning, calls) = match turn {
                ModelTurn::Final { answer, .. } => {
                    info!(
                        iterations = iteration + 1,
                        steps = steps.len(),
                        "agent loop completed with final answer"
                    );
                    messages.push(Message::assistant(answer.clone()));
                    return Ok((answer, steps));
                }
                ModelTurn::ToolCalls { reasoning, calls } => (reasoning, calls),
            };

            debug!(
                iteration,
                tool_count = calls.len(),
                tools = ?calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "model requested tool calls"
            );
            if !reasoning.is_empty() {
                last_thought.clone_from(&reasoning);
            }
            messages.push(Message::assistant_tool_calls(reasoning, calls.clone()));

            for call in calls {
                callbacks.on_tool_call(&call);
                detector.record(&call)?;
                check_cancel(cancel)?;

                let verdict = self
                    .gate
                    .authorize(&call, mode, policy, host, cancel, |ticket| {
                        callbacks.on_confirmation_needed(ticket)
                    })
                    .await?;

                match verdict {
                    Authorization::Denied { reason } => {
                        warn!(tool = %call.name, id = %call.id, %reason, "tool call denied");
                        if reason == DENIED_BY_POLICY {
                            callbacks.on_tool_blocked(&call.name, &reason);
                        }
                        let denial =
                            ToolResult::failed(&call, format!("tool call denied ({reason})"));
                        messages.push(denial.to_message());
                        step.denied.push(DeniedCall {
                            call_id: call.id.clone(),
                            tool: call.name.clone(),
                            reason,
                        });
                    }
                    Authorization::Allowed => {
                        check_cancel(cancel)?;
                        debug!(tool = %call.name, id = %call.id, "executing tool");
                        let result = execute_call(host, &call).await?;
                        callbacks.on_tool_result(&result);
                        messages.push(result.to_message());
                        step.observations.push(result);
                        check_cancel(cancel)?;
                    }
                }
                step.actions.push(call);
            }

            step.finished_at = Utc::now();
            callbacks.on_step_complete(&step);
            steps.push(step);
            iteration += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        warn!("agent run cancelled");
        return Err(AgentError::Aborted);
    }
    Ok(())
}

/// Settle a tool-call exchange cut short by `err`.
///
/// Only the last assistant message can be incomplete: the loop answers every
/// call of an iteration before the next model request.
fn close_unanswered_calls(messages: &mut Vec<Message>, err: &AgentError) {
    let Some(pos) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
        return;
    };
    if messages[pos].tool_calls.is_empty() {
        return;
    }

    let answered: Vec<String> = messages[pos + 1..]
        .iter()
        .filter_map(|m| m.tool_call_id.clone())
        .collect();
    if answered.is_empty() {
        debug!(kind = err.kind(), "dropping unanswered tool-call message");
        messages.truncate(pos);
        return;
    }

    let unanswered: Vec<ToolCall> = messages[pos]
        .tool_calls
        .iter()
        .filter(|call| !answered.contains(&call.id))
        .cloned()
        .collect();
    for call in &unanswered {
        let skipped = ToolResult::failed(call, format!("tool call not run ({})", err.kind()));
        messages.push(skipped.to_message());
    }
    if !unanswered.is_empty() {
        debug!(kind = err.kind(), skipped = unanswered.len(), "closed unanswered tool calls");
    }
}

/// Stream one model response, forwarding reasoning fragments.
///
/// Cancellation drops the stream, which is how the client is told to stop.
async fn receive_turn(
    model: &dyn ModelClient,
    request: ModelRequest<'_>,
    cancel: &CancellationToken,
    callbacks: &dyn AgentCallbacks,
) -> Result<ModelTurn> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AgentError::Aborted),
        sent = model.send(request) => sent.map_err(into_model_error)?,
    };

    let mut acc = TurnAccumulator::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Aborted),
            event = stream.next() => event,
        };
        match event {
            None => break,
            Some(Ok(event)) => {
                if let ModelEvent::Reasoning(text) = &event {
                    callbacks.on_reasoning_token(text);
                }
                acc.push(event);
            }
            Some(Err(err)) => return Err(into_model_error(err)),
        }
    }

    check_cancel(cancel)?;
    acc.finish()
}
