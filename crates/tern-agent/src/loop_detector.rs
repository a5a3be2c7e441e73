//! Repeated-action detection.
//!
//! Remembers the signatures of the most recent tool calls across a whole run
//! and aborts when one signature shows up more often than allowed, so a model
//! retrying the same failing action cannot spin until the iteration cap.

use std::collections::VecDeque;
use std::fmt;

use serde_json::Value;

use crate::config::LoopDetectionConfig;
use crate::error::{AgentError, Result};
use crate::llm::types::ToolCall;

/// Longest argument text kept in a loop report.
const ACTION_DISPLAY_CHARS: usize = 200;

/// A tool name plus its arguments in canonical form (object keys sorted at
/// every depth), so key order never distinguishes two calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub tool: String,
    pub arguments: String,
}

impl CallSignature {
    /// Signature of `call`.
    pub fn of(call: &ToolCall) -> Self {
        let mut arguments = String::new();
        write_canonical(&call.arguments, &mut arguments);
        Self {
            tool: call.name.clone(),
            arguments,
        }
    }
}

impl fmt::Display for CallSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.arguments.char_indices().nth(ACTION_DISPLAY_CHARS) {
            Some((idx, _)) => write!(f, "{} {}...", self.tool, &self.arguments[..idx]),
            None => write!(f, "{} {}", self.tool, self.arguments),
        }
    }
}

/// Rolling-window tracker of call signatures.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: usize,
    max_repeats: u32,
    recent: VecDeque<CallSignature>,
}

impl LoopDetector {
    /// Create a detector from configuration.
    pub fn new(config: &LoopDetectionConfig) -> Self {
        Self {
            window: config.window.max(1),
            max_repeats: config.max_repeats,
            recent: VecDeque::with_capacity(config.window + 1),
        }
    }

    /// Record a call about to be attempted.
    ///
    /// Returns [`AgentError::LoopDetected`] when the call's signature now
    /// appears more than `max_repeats` times in the window; `attempts` is
    /// that count.
    pub fn record(&mut self, call: &ToolCall) -> Result<()> {
        let signature = CallSignature::of(call);

        self.recent.push_back(signature.clone());
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }

        let attempts = self.occurrences(&signature);
        if attempts > self.max_repeats {
            tracing::warn!(
                tool = %signature.tool,
                attempts,
                window = self.window,
                "repeated tool call detected"
            );
            return Err(AgentError::LoopDetected {
                action: signature.to_string(),
                attempts,
            });
        }
        Ok(())
    }

    /// How many times `signature` appears in the window.
    pub fn occurrences(&self, signature: &CallSignature) -> u32 {
        self.recent.iter().filter(|s| *s == signature).count() as u32
    }
}

/// Serialize `value` as JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector(window: usize, max_repeats: u32) -> LoopDetector {
        LoopDetector::new(&LoopDetectionConfig {
            window,
            max_repeats,
        })
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new("id", name, args)
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = CallSignature::of(&call("grep", json!({"pattern": "x", "path": "src"})));
        let b = CallSignature::of(&call("grep", json!({"path": "src", "pattern": "x"})));
        assert_eq!(a, b);
    }

    #[test]
    fn nested_objects_are_canonical() {
        let a = CallSignature::of(&call("t", json!({"o": {"b": 1, "a": [1, {"z": 0, "y": 1}]}})));
        assert_eq!(a.arguments, r#"{"o":{"a":[1,{"y":1,"z":0}],"b":1}}"#);
    }

    #[test]
    fn aborts_on_repeat_beyond_threshold() {
        let mut d = detector(5, 3);
        let c = call("read_file", json!({"path": "missing.rs"}));
        for _ in 0..3 {
            d.record(&c).unwrap();
        }
        match d.record(&c) {
            Err(AgentError::LoopDetected { action, attempts }) => {
                assert_eq!(attempts, 4);
                assert!(action.starts_with("read_file "));
            }
            other => panic!("expected loop detection, got {other:?}"),
        }
    }

    #[test]
    fn interleaved_calls_count_within_window() {
        let mut d = detector(5, 2);
        let a = call("a", json!({}));
        let b = call("b", json!({}));
        d.record(&a).unwrap();
        d.record(&b).unwrap();
        d.record(&a).unwrap();
        d.record(&b).unwrap();
        let err = d.record(&a).unwrap_err();
        assert_eq!(
            err,
            AgentError::LoopDetected {
                action: "a {}".into(),
                attempts: 3
            }
        );
    }

    #[test]
    fn old_signatures_fall_out_of_window() {
        let mut d = detector(3, 1);
        let a = call("a", json!({}));
        d.record(&a).unwrap();
        d.record(&call("b", json!({}))).unwrap();
        d.record(&call("c", json!({}))).unwrap();
        d.record(&call("d", json!({}))).unwrap();
        // `a` has been evicted, so it may run again.
        d.record(&a).unwrap();
    }

    #[test]
    fn different_arguments_are_different_actions() {
        let mut d = detector(5, 1);
        d.record(&call("read_file", json!({"path": "a"}))).unwrap();
        d.record(&call("read_file", json!({"path": "b"}))).unwrap();
        d.record(&call("read_file", json!({"path": "c"}))).unwrap();
    }

    #[test]
    fn long_arguments_are_shortened_for_display() {
        let sig = CallSignature::of(&call("write_file", json!({"content": "x".repeat(500)})));
        let shown = sig.to_string();
        assert!(shown.ends_with("..."));
        assert!(shown.len() < 300);
    }
}
