//! The safety gate.
//!
//! Every tool call passes through [`SafetyGate::authorize`] before it runs.
//! Safe calls go straight through; everything else consults the session's
//! [`ToolPolicyMemory`] and, failing that, suspends on a
//! [`ConfirmationTicket`] until the caller's UI answers or the run is
//! cancelled.
//!
//! # Confirmation protocol
//!
//! ```text
//! gate ──ticket(request, reply: oneshot::Sender)──> UI
//!  │                                                │
//!  └──── select! { reply, cancel } <── respond() ───┘
//! ```
//!
//! [`ConfirmationTicket::respond`] consumes the ticket, so a request can be
//! answered at most once.  If the run is cancelled first, the receiver is
//! dropped and a late answer is discarded.  If the UI drops the ticket without
//! answering, the call is denied.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::host::AgentHost;
use crate::llm::types::ToolCall;
use crate::safety::risk::{Mode, PreviewKind, RiskLevel, RiskTable};

/// Maximum characters of content shown in a preview.
pub const PREVIEW_MAX_CHARS: usize = 2000;

/// Denial reason when the user said no.
pub const DENIED_BY_USER: &str = "user";

/// Denial reason when a remembered `always_deny` applied.
pub const DENIED_BY_POLICY: &str = "policy";

/// Denial reason when the confirmation was dropped unanswered.
pub const DENIED_UNANSWERED: &str = "confirmation dismissed";

// ---------------------------------------------------------------------------
// Policy memory
// ---------------------------------------------------------------------------

/// A remembered per-tool decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicy {
    AlwaysAllow,
    AlwaysDeny,
}

/// Per-session tool overrides, written only by `allow_always` /
/// `deny_always` answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicyMemory {
    entries: HashMap<String, ToolPolicy>,
}

impl ToolPolicyMemory {
    /// An empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The remembered policy for `tool`, if any.
    pub fn get(&self, tool: &str) -> Option<ToolPolicy> {
        self.entries.get(tool).copied()
    }

    /// Remember `policy` for `tool`, replacing any previous entry.
    pub fn set(&mut self, tool: impl Into<String>, policy: ToolPolicy) {
        self.entries.insert(tool.into(), policy);
    }

    /// Forget the entry for `tool`, so its calls ask again.
    pub fn remove(&mut self, tool: &str) -> Option<ToolPolicy> {
        self.entries.remove(tool)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Confirmation types
// ---------------------------------------------------------------------------

/// What the user is shown before deciding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preview {
    /// A shell command and the directory it will run in.
    Command { command: String, cwd: PathBuf },
    /// Content that will be sent or written.
    Content { content: String, truncated: bool },
    /// A file before and after the change.
    FileDiff {
        file_path: String,
        before: String,
        after: String,
    },
}

/// A request for a human decision about one tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmationRequest {
    /// Tool name.
    pub tool: String,
    /// The call awaiting the decision.
    pub call_id: String,
    /// Classification after mode adjustment.
    pub risk_level: RiskLevel,
    /// One-line description of what will happen.
    pub description: String,
    /// Optional preview.
    pub preview: Option<Preview>,
}

/// The user's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationAction {
    Allow,
    Deny,
    AllowAlways,
    DenyAlways,
}

/// A confirmation answer, optionally naming the tool an `*_always` answer
/// should be remembered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub action: ConfirmationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_tool: Option<String>,
}

impl ConfirmationResponse {
    fn of(action: ConfirmationAction) -> Self {
        Self {
            action,
            for_tool: None,
        }
    }

    pub fn allow() -> Self {
        Self::of(ConfirmationAction::Allow)
    }

    pub fn deny() -> Self {
        Self::of(ConfirmationAction::Deny)
    }

    pub fn allow_always() -> Self {
        Self::of(ConfirmationAction::AllowAlways)
    }

    pub fn deny_always() -> Self {
        Self::of(ConfirmationAction::DenyAlways)
    }

    /// Builder: remember the decision under a different tool name.
    pub fn for_tool(mut self, tool: impl Into<String>) -> Self {
        self.for_tool = Some(tool.into());
        self
    }
}

/// A pending confirmation handed to the UI.
///
/// Answer it with [`ConfirmationTicket::respond`].  Dropping it unanswered
/// denies the call.
#[derive(Debug)]
pub struct ConfirmationTicket {
    request: ConfirmationRequest,
    reply: oneshot::Sender<ConfirmationResponse>,
}

impl ConfirmationTicket {
    /// Create a ticket and the receiver the gate waits on.
    pub fn new(request: ConfirmationRequest) -> (Self, oneshot::Receiver<ConfirmationResponse>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }

    /// The request being asked about.
    pub fn request(&self) -> &ConfirmationRequest {
        &self.request
    }

    /// Answer the request.
    ///
    /// Returns `false` if nobody is waiting any more (the run was cancelled).
    pub fn respond(self, response: ConfirmationResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outcome of evaluating a call without asking anyone.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allowed,
    Denied { reason: String },
    NeedsConfirmation { request: ConfirmationRequest },
}

/// Final verdict for a call, after any confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied { reason: String },
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Classifies tool calls and decides whether they may run.
#[derive(Debug, Clone, Default)]
pub struct SafetyGate {
    table: RiskTable,
}

impl SafetyGate {
    /// Create a gate backed by `table`.
    pub fn new(table: RiskTable) -> Self {
        Self { table }
    }

    /// The risk table in use.
    pub fn table(&self) -> &RiskTable {
        &self.table
    }

    /// Classify `call` for `mode`.
    pub fn classify(&self, call: &ToolCall, mode: Mode) -> RiskLevel {
        self.table.classify(call, mode)
    }

    /// Decide what to do with `call` without asking the user.
    ///
    /// `host` is only consulted to build previews.
    pub async fn evaluate(
        &self,
        call: &ToolCall,
        mode: Mode,
        policy: &ToolPolicyMemory,
        host: &dyn AgentHost,
    ) -> GateDecision {
        let risk = self.classify(call, mode);
        if risk == RiskLevel::Safe {
            return GateDecision::Allowed;
        }

        match policy.get(&call.name) {
            Some(ToolPolicy::AlwaysAllow) => {
                tracing::debug!(tool = %call.name, "allowed by session policy");
                GateDecision::Allowed
            }
            Some(ToolPolicy::AlwaysDeny) => {
                tracing::debug!(tool = %call.name, "denied by session policy");
                GateDecision::Denied {
                    reason: DENIED_BY_POLICY.to_owned(),
                }
            }
            None => GateDecision::NeedsConfirmation {
                request: ConfirmationRequest {
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                    risk_level: risk,
                    description: describe(call, risk),
                    preview: self.preview(call, host).await,
                },
            },
        }
    }

    /// Decide whether `call` may run, asking the user when needed.
    ///
    /// `ask` receives the ticket when a confirmation is required; it must not
    /// block.  The wait is cancelled by `cancel`, in which case this returns
    /// [`AgentError::Aborted`] and the policy memory is left untouched.
    pub async fn authorize<F>(
        &self,
        call: &ToolCall,
        mode: Mode,
        policy: &mut ToolPolicyMemory,
        host: &dyn AgentHost,
        cancel: &CancellationToken,
        ask: F,
    ) -> Result<Authorization>
    where
        F: FnOnce(ConfirmationTicket),
    {
        let request = match self.evaluate(call, mode, policy, host).await {
            GateDecision::Allowed => return Ok(Authorization::Allowed),
            GateDecision::Denied { reason } => return Ok(Authorization::Denied { reason }),
            GateDecision::NeedsConfirmation { request } => request,
        };

        if cancel.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        tracing::debug!(
            tool = %call.name,
            risk = %request.risk_level,
            "waiting for confirmation"
        );

        let (ticket, rx) = ConfirmationTicket::new(request);
        ask(ticket);

        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Aborted),
            answer = rx => answer,
        };

        if cancel.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        let Ok(response) = answer else {
            tracing::warn!(tool = %call.name, "confirmation dropped without an answer");
            return Ok(Authorization::Denied {
                reason: DENIED_UNANSWERED.to_owned(),
            });
        };

        let remember_as = response.for_tool.unwrap_or_else(|| call.name.clone());
        let verdict = match response.action {
            ConfirmationAction::Allow => Authorization::Allowed,
            ConfirmationAction::Deny => Authorization::Denied {
                reason: DENIED_BY_USER.to_owned(),
            },
            ConfirmationAction::AllowAlways => {
                policy.set(remember_as, ToolPolicy::AlwaysAllow);
                Authorization::Allowed
            }
            ConfirmationAction::DenyAlways => {
                policy.set(remember_as, ToolPolicy::AlwaysDeny);
                Authorization::Denied {
                    reason: DENIED_BY_USER.to_owned(),
                }
            }
        };

        tracing::info!(tool = %call.name, action = ?response.action, "confirmation answered");
        Ok(verdict)
    }

    /// Build the preview for `call`, if its tool has one and the needed
    /// arguments are present.
    async fn preview(&self, call: &ToolCall, host: &dyn AgentHost) -> Option<Preview> {
        match self.table.rule(&call.name).preview {
            PreviewKind::None => None,
            PreviewKind::Command => {
                let command = call.str_arg("command")?.to_owned();
                let cwd = call
                    .str_arg("cwd")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| host.working_dir());
                Some(Preview::Command { command, cwd })
            }
            PreviewKind::Content => {
                let raw = ["content", "prompt", "url", "path"]
                    .iter()
                    .find_map(|key| call.str_arg(key))
                    .map(str::to_owned)
                    .unwrap_or_else(|| pretty_arguments(&call.arguments));
                let (content, truncated) = truncate_chars(&raw, PREVIEW_MAX_CHARS);
                Some(Preview::Content { content, truncated })
            }
            PreviewKind::FileDiff => {
                let file_path = call.str_arg("path").or_else(|| call.str_arg("file_path"))?;
                let before = host.read_file(file_path).await.unwrap_or_default();
                let after = match (
                    call.str_arg("content"),
                    call.str_arg("old_string"),
                    call.str_arg("new_string"),
                ) {
                    (Some(content), _, _) => content.to_owned(),
                    (None, Some(old), Some(new)) => before.replacen(old, new, 1),
                    _ => before.clone(),
                };
                Some(Preview::FileDiff {
                    file_path: file_path.to_owned(),
                    before,
                    after,
                })
            }
        }
    }
}

/// One-line description of a call for the confirmation prompt.
fn describe(call: &ToolCall, risk: RiskLevel) -> String {
    let target = call
        .str_arg("command")
        .or_else(|| call.str_arg("path"))
        .or_else(|| call.str_arg("file_path"))
        .or_else(|| call.str_arg("url"));
    match target {
        Some(target) => {
            let (target, _) = truncate_chars(target, 120);
            format!("{} `{target}` ({risk})", call.name)
        }
        None => format!("{} ({risk})", call.name),
    }
}

fn pretty_arguments(arguments: &Value) -> String {
    serde_json::to_string_pretty(arguments).unwrap_or_else(|_| arguments.to_string())
}

/// Truncate to at most `max` characters, reporting whether anything was cut.
fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((idx, _)) => (text[..idx].to_owned(), true),
        None => (text.to_owned(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ToolFailure;
    use crate::llm::types::ToolDefinition;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct PreviewHost;

    #[async_trait]
    impl AgentHost for PreviewHost {
        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }

        async fn execute(
            &self,
            _tool_name: &str,
            _arguments: &Value,
        ) -> std::result::Result<String, ToolFailure> {
            Ok(String::new())
        }

        fn working_dir(&self) -> PathBuf {
            PathBuf::from("/work")
        }

        async fn read_file(&self, path: &str) -> Option<String> {
            (path == "src/lib.rs").then(|| "fn old() {}\n".to_owned())
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new("tc_1", name, args)
    }

    #[tokio::test]
    async fn safe_tool_is_allowed_without_confirmation() {
        let gate = SafetyGate::default();
        let decision = gate
            .evaluate(
                &call("list_dir", json!({"path": "/tmp"})),
                Mode::Plan,
                &ToolPolicyMemory::new(),
                &PreviewHost,
            )
            .await;
        assert_eq!(decision, GateDecision::Allowed);
    }

    #[tokio::test]
    async fn remembered_policy_short_circuits() {
        let gate = SafetyGate::default();
        let mut policy = ToolPolicyMemory::new();
        policy.set("bash", ToolPolicy::AlwaysDeny);
        policy.set("write_file", ToolPolicy::AlwaysAllow);

        let denied = gate
            .evaluate(&call("bash", json!({"command": "ls"})), Mode::Build, &policy, &PreviewHost)
            .await;
        assert_eq!(
            denied,
            GateDecision::Denied {
                reason: DENIED_BY_POLICY.into()
            }
        );

        let allowed = gate
            .evaluate(
                &call("write_file", json!({"path": "a", "content": "b"})),
                Mode::Build,
                &policy,
                &PreviewHost,
            )
            .await;
        assert_eq!(allowed, GateDecision::Allowed);
    }

    #[tokio::test]
    async fn removed_policy_asks_again() {
        let gate = SafetyGate::default();
        let mut policy = ToolPolicyMemory::new();
        policy.set("bash", ToolPolicy::AlwaysAllow);
        let ls = call("bash", json!({"command": "ls"}));

        let remembered = gate.evaluate(&ls, Mode::Build, &policy, &PreviewHost).await;
        assert_eq!(remembered, GateDecision::Allowed);

        assert_eq!(policy.remove("bash"), Some(ToolPolicy::AlwaysAllow));
        assert_eq!(policy.remove("bash"), None);
        assert!(policy.is_empty());

        let decision = gate.evaluate(&ls, Mode::Build, &policy, &PreviewHost).await;
        assert!(matches!(decision, GateDecision::NeedsConfirmation { .. }));
    }

    #[tokio::test]
    async fn command_preview_uses_host_working_dir() {
        let gate = SafetyGate::default();
        let decision = gate
            .evaluate(
                &call("run_command", json!({"command": "rm -rf target"})),
                Mode::Build,
                &ToolPolicyMemory::new(),
                &PreviewHost,
            )
            .await;
        let GateDecision::NeedsConfirmation { request } = decision else {
            panic!("expected confirmation, got {decision:?}");
        };
        assert_eq!(request.risk_level, RiskLevel::Dangerous);
        assert_eq!(
            request.preview,
            Some(Preview::Command {
                command: "rm -rf target".into(),
                cwd: PathBuf::from("/work"),
            })
        );
        assert!(request.description.contains("rm -rf target"));
    }

    #[tokio::test]
    async fn edit_preview_applies_replacement() {
        let gate = SafetyGate::default();
        let decision = gate
            .evaluate(
                &call(
                    "edit_file",
                    json!({"path": "src/lib.rs", "old_string": "old", "new_string": "new"}),
                ),
                Mode::Build,
                &ToolPolicyMemory::new(),
                &PreviewHost,
            )
            .await;
        let GateDecision::NeedsConfirmation { request } = decision else {
            panic!("expected confirmation");
        };
        assert_eq!(
            request.preview,
            Some(Preview::FileDiff {
                file_path: "src/lib.rs".into(),
                before: "fn old() {}\n".into(),
                after: "fn new() {}\n".into(),
            })
        );
    }

    #[tokio::test]
    async fn content_preview_is_truncated() {
        let gate = SafetyGate::default();
        let long = "x".repeat(PREVIEW_MAX_CHARS + 50);
        let decision = gate
            .evaluate(
                &call("task", json!({ "prompt": long })),
                Mode::Build,
                &ToolPolicyMemory::new(),
                &PreviewHost,
            )
            .await;
        let GateDecision::NeedsConfirmation { request } = decision else {
            panic!("expected confirmation");
        };
        match request.preview {
            Some(Preview::Content { content, truncated }) => {
                assert!(truncated);
                assert_eq!(content.chars().count(), PREVIEW_MAX_CHARS);
            }
            other => panic!("unexpected preview {other:?}"),
        }
    }

    #[tokio::test]
    async fn allow_always_is_remembered() {
        let gate = SafetyGate::default();
        let mut policy = ToolPolicyMemory::new();
        let cancel = CancellationToken::new();
        let c = call("write_file", json!({"path": "a.txt", "content": "hi"}));

        let verdict = gate
            .authorize(&c, Mode::Build, &mut policy, &PreviewHost, &cancel, |ticket| {
                assert_eq!(ticket.request().tool, "write_file");
                assert!(ticket.respond(ConfirmationResponse::allow_always()));
            })
            .await
            .unwrap();
        assert_eq!(verdict, Authorization::Allowed);
        assert_eq!(policy.get("write_file"), Some(ToolPolicy::AlwaysAllow));

        let asked = Mutex::new(false);
        let again = gate
            .authorize(&c, Mode::Build, &mut policy, &PreviewHost, &cancel, |_| {
                *asked.lock().unwrap() = true;
            })
            .await
            .unwrap();
        assert_eq!(again, Authorization::Allowed);
        assert!(!*asked.lock().unwrap());
    }

    #[tokio::test]
    async fn deny_always_can_target_another_tool() {
        let gate = SafetyGate::default();
        let mut policy = ToolPolicyMemory::new();
        let cancel = CancellationToken::new();
        let c = call("bash", json!({"command": "make"}));

        let verdict = gate
            .authorize(&c, Mode::Build, &mut policy, &PreviewHost, &cancel, |ticket| {
                ticket.respond(ConfirmationResponse::deny_always().for_tool("run_command"));
            })
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Authorization::Denied {
                reason: DENIED_BY_USER.into()
            }
        );
        assert_eq!(policy.get("run_command"), Some(ToolPolicy::AlwaysDeny));
        assert_eq!(policy.get("bash"), None);
    }

    #[tokio::test]
    async fn dropped_ticket_denies() {
        let gate = SafetyGate::default();
        let mut policy = ToolPolicyMemory::new();
        let verdict = gate
            .authorize(
                &call("bash", json!({"command": "make"})),
                Mode::Build,
                &mut policy,
                &PreviewHost,
                &CancellationToken::new(),
                drop,
            )
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Authorization::Denied {
                reason: DENIED_UNANSWERED.into()
            }
        );
    }

    #[tokio::test]
    async fn cancel_while_waiting_aborts_and_discards_late_answer() {
        let gate = SafetyGate::default();
        let mut policy = ToolPolicyMemory::new();
        let cancel = CancellationToken::new();
        let parked: Mutex<Option<ConfirmationTicket>> = Mutex::new(None);

        let trigger = cancel.clone();
        let err = gate
            .authorize(
                &call("bash", json!({"command": "make"})),
                Mode::Build,
                &mut policy,
                &PreviewHost,
                &cancel,
                |ticket| {
                    *parked.lock().unwrap() = Some(ticket);
                    trigger.cancel();
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Aborted);

        let ticket = parked.lock().unwrap().take().unwrap();
        assert!(!ticket.respond(ConfirmationResponse::allow_always()));
        assert!(policy.is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let (text, cut) = truncate_chars("héllo", 2);
        assert_eq!(text, "hé");
        assert!(cut);
        let (text, cut) = truncate_chars("hi", 5);
        assert_eq!(text, "hi");
        assert!(!cut);
    }
}
