//! Runtime settings merged from built-in defaults and an optional TOML file.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::DomainOsErr;
use crate::error::Result;

pub const DEFAULT_MODEL_PROVIDER: &str = "anthropic";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Settings surfaced to the host. The advisory limits and the dedup window
/// are configuration values rather than hard-wired constants.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Max advisory artifacts persisted per domain in a rolling hour.
    pub advisory_hourly_limit: u32,
    /// Max advisory artifacts persisted per domain per calendar day.
    pub advisory_daily_limit: u32,
    /// Window within which an identical fingerprint reuses the prior
    /// artifact instead of inserting a new row.
    pub advisory_dedupe_window_hours: i64,

    /// Upper bound on tool-use rounds within one chat turn.
    pub max_tool_rounds: usize,
    /// Per-round LLM timeout in seconds.
    pub per_round_timeout_secs: u64,

    /// Token budget for the per-turn system prompt.
    pub chat_prompt_token_budget: usize,
    /// Token budget for the portfolio briefing prompt.
    pub briefing_token_budget: usize,

    /// Automation runs older than this many days become eligible for
    /// retention cleanup.
    pub automation_retention_days: i64,
    /// The latest N runs per automation are always kept.
    pub automation_retention_keep_latest: i64,

    /// Global default provider, used when a domain has no override.
    pub model_provider: String,
    pub model_name: String,

    /// Per-provider base URL overrides, e.g. a non-default Ollama install.
    pub provider_base_urls: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            advisory_hourly_limit: 10,
            advisory_daily_limit: 30,
            advisory_dedupe_window_hours: 24,
            max_tool_rounds: 8,
            per_round_timeout_secs: 120,
            chat_prompt_token_budget: 24_000,
            briefing_token_budget: 48_000,
            automation_retention_days: 30,
            automation_retention_keep_latest: 50,
            model_provider: DEFAULT_MODEL_PROVIDER.to_string(),
            model_name: DEFAULT_MODEL.to_string(),
            provider_base_urls: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for any
    /// missing key. A missing file yields pure defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| DomainOsErr::Validation(format!("settings file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_constants() {
        let s = Settings::default();
        assert_eq!(s.advisory_hourly_limit, 10);
        assert_eq!(s.advisory_daily_limit, 30);
        assert_eq!(s.advisory_dedupe_window_hours, 24);
        assert_eq!(s.max_tool_rounds, 8);
        assert_eq!(s.briefing_token_budget, 48_000);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let s: Settings = toml::from_str("advisory_hourly_limit = 2\n").unwrap();
        assert_eq!(s.advisory_hourly_limit, 2);
        assert_eq!(s.advisory_daily_limit, 30);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let s = Settings::load(Path::new("/nonexistent/settings.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }
}
