//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so a missing or partial file is always usable.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a `{{path}}` placeholder becomes when the path does not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPathPolicy {
    /// Substitute an empty string and log a warning.
    #[default]
    Empty,
    /// Fail the step with a template resolution error.
    Fail,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on concurrent sub-invocations inside one fan-out step.
    #[serde(default = "default_max_fan_out_workers")]
    pub max_fan_out_workers: usize,

    #[serde(default)]
    pub missing_path: MissingPathPolicy,

    /// Treat memory store read failures as "no context" instead of failing the step.
    #[serde(default)]
    pub tolerate_store_read_errors: bool,

    /// Seconds before an unanswered gate is denied. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_timeout_secs: Option<u64>,

    /// Timeout applied to every tool without a per-tool override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tool_timeout_secs: Option<u64>,

    /// Per-tool timeout overrides in seconds, keyed by tool name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_timeouts: BTreeMap<String, u64>,

    /// Age used by `memory purge` when no explicit cutoff is given.
    #[serde(default = "default_memory_retention_days")]
    pub memory_retention_days: u32,

    /// Step outputs larger than this are truncated in the run scope.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,
}

fn default_max_fan_out_workers() -> usize {
    4
}

fn default_memory_retention_days() -> u32 {
    30
}

fn default_max_step_output_bytes() -> usize {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fan_out_workers: default_max_fan_out_workers(),
            missing_path: MissingPathPolicy::default(),
            tolerate_store_read_errors: false,
            gate_timeout_secs: None,
            default_tool_timeout_secs: None,
            tool_timeouts: BTreeMap::new(),
            memory_retention_days: default_memory_retention_days(),
            max_step_output_bytes: default_max_step_output_bytes(),
        }
    }
}

impl EngineConfig {
    pub fn gate_timeout(&self) -> Option<Duration> {
        self.gate_timeout_secs.map(Duration::from_secs)
    }

    /// Timeout for `tool`: per-tool override, else the global default.
    pub fn tool_timeout(&self, tool: &str) -> Option<Duration> {
        self.tool_timeouts
            .get(tool)
            .copied()
            .or(self.default_tool_timeout_secs)
            .map(Duration::from_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.memory_retention_days) * 24 * 60 * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_fan_out_workers, 4);
        assert_eq!(config.missing_path, MissingPathPolicy::Empty);
        assert!(!config.tolerate_store_read_errors);
        assert!(config.gate_timeout().is_none());
        assert!(config.tool_timeout("echo").is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
missing_path = "fail"
default_tool_timeout_secs = 60

[tool_timeouts]
model_call = 120
"#,
        )
        .unwrap();
        assert_eq!(config.missing_path, MissingPathPolicy::Fail);
        assert_eq!(config.max_fan_out_workers, 4);
        assert_eq!(config.tool_timeout("model_call"), Some(Duration::from_secs(120)));
        assert_eq!(config.tool_timeout("echo"), Some(Duration::from_secs(60)));
        assert_eq!(config.memory_retention_days, 30);
    }
}
