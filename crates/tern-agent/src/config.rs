//! Agent configuration.
//!
//! Every knob has a default, so a TOML file only needs the values it wants to
//! change:
//!
//! ```toml
//! [agent]
//! max_iterations = 30
//!
//! [loop_detection]
//! window = 6
//! max_repeats = 3
//!
//! [context]
//! max_tokens = 200000
//! near_limit_percent = 75.0
//! ```
//!
//! `TERN_MAX_ITERATIONS` and `TERN_MAX_CONTEXT_TOKENS` override the file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Environment variable overriding [`LoopConfig::max_iterations`].
pub const ENV_MAX_ITERATIONS: &str = "TERN_MAX_ITERATIONS";

/// Environment variable overriding [`ContextConfig::max_tokens`].
pub const ENV_MAX_CONTEXT_TOKENS: &str = "TERN_MAX_CONTEXT_TOKENS";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Limits for a single agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Maximum reasoning/tool iterations before giving up.
    pub max_iterations: u32,

    /// Optional cap on tokens generated per model response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_tokens: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_response_tokens: None,
        }
    }
}

/// Repeated-action detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    /// Number of most recent call signatures remembered.
    pub window: usize,

    /// How many times one signature may appear inside the window.  One more
    /// occurrence aborts the run.
    pub max_repeats: u32,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            window: 5,
            max_repeats: 3,
        }
    }
}

/// Context budget and compaction thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Context window of the model, in tokens.
    pub max_tokens: usize,

    /// Usage at which compaction starts (`light`) and `is_near_limit` flips.
    pub near_limit_percent: f64,

    /// Usage at which compaction becomes `moderate`.
    pub moderate_percent: f64,

    /// Usage at which compaction becomes `aggressive` and `is_critical` flips.
    pub critical_percent: f64,

    /// Messages kept verbatim by a light compaction.
    pub keep_recent_light: usize,

    /// Messages kept verbatim by a moderate compaction.
    pub keep_recent_moderate: usize,

    /// Messages kept verbatim by an aggressive compaction.
    pub keep_recent_aggressive: usize,

    /// Token cap for the summarization response.
    pub summary_max_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            near_limit_percent: 80.0,
            moderate_percent: 85.0,
            critical_percent: 90.0,
            keep_recent_light: 10,
            keep_recent_moderate: 6,
            keep_recent_aggressive: 4,
            summary_max_tokens: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Complete agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: LoopConfig,
    pub loop_detection: LoopDetectionConfig,
    pub context: ContextConfig,
}

impl AgentConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = ?path, "configuration file does not exist, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(path = ?path, "configuration loaded from file");
        Ok(config)
    }

    /// Load from a TOML file, then apply `TERN_*` environment overrides.
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            reason: format!("failed to serialize config: {e}"),
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup, then re-validate.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_ITERATIONS) {
            self.agent.max_iterations = parse_override(ENV_MAX_ITERATIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONTEXT_TOKENS) {
            self.context.max_tokens = parse_override(ENV_MAX_CONTEXT_TOKENS, &raw)?;
        }
        self.validate()
    }

    /// Reject values that would disable a safety valve or make the
    /// compaction scale inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(invalid("agent.max_iterations must be > 0"));
        }

        let detection = &self.loop_detection;
        if detection.max_repeats == 0 {
            return Err(invalid("loop_detection.max_repeats must be > 0"));
        }
        if detection.window <= detection.max_repeats as usize {
            return Err(invalid(format!(
                "loop_detection.window ({}) must exceed max_repeats ({})",
                detection.window, detection.max_repeats
            )));
        }

        let ctx = &self.context;
        if ctx.max_tokens == 0 {
            return Err(invalid("context.max_tokens must be > 0"));
        }
        let ordered = 0.0 < ctx.near_limit_percent
            && ctx.near_limit_percent <= ctx.moderate_percent
            && ctx.moderate_percent <= ctx.critical_percent;
        if !ordered {
            return Err(invalid(format!(
                "context thresholds must satisfy 0 < near_limit ({}) <= moderate ({}) <= critical ({})",
                ctx.near_limit_percent, ctx.moderate_percent, ctx.critical_percent
            )));
        }
        if ctx.keep_recent_aggressive == 0 {
            return Err(invalid("context.keep_recent_aggressive must be > 0"));
        }
        if !(ctx.keep_recent_light >= ctx.keep_recent_moderate
            && ctx.keep_recent_moderate >= ctx.keep_recent_aggressive)
        {
            return Err(invalid(
                "context.keep_recent_* must not increase from light to aggressive",
            ));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(format!("{key} is not a valid number: {raw:?}")))
}
