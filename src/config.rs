//! Engine and processor configuration.
//!
//! Plain serde structs with field-level defaults, loadable from TOML and
//! topped up from the environment:
//!
//! ```toml
//! default_processor = "anthropic"
//!
//! [processors.anthropic]
//! model = "claude-3-5-sonnet-latest"
//! max_tokens = 1024
//!
//! [processors.anthropic.retry]
//! max_attempts = 3
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{SoulError, SoulResult};

// ─── Retry ───────────────────────────────────────────────────────────────────

/// Bounded exponential backoff shared by transport and schema retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_jitter_ms() -> u64 {
    50
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        }
    }

    /// Full attempt budget with near-zero delays (tests, local backends).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter_ms: 0,
        }
    }

    /// Delay before `attempt` (1-based retry number): base * 2^(attempt-1), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(20));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms))
    }
}

// ─── Processor Options ───────────────────────────────────────────────────────

/// Options handed to a processor factory from the registry.
///
/// Unset role-shaping flags fall back to the backend's own defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessorOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_system_message: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_role_alternation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Applied when neither the call nor the processor options set a timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

impl ProcessorOptions {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

// ─── Engine Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_processor")]
    pub default_processor: String,
    #[serde(default)]
    pub processors: HashMap<String, ProcessorOptions>,
}

fn default_processor() -> String {
    "openai".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_processor: default_processor(),
            processors: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> SoulResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> SoulResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SoulError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Fill unset API keys and base URLs for the built-in labels from the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for (label, key_var, url_var) in [
            ("openai", "OPENAI_API_KEY", "OPENAI_BASE_URL"),
            ("anthropic", "ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"),
        ] {
            let key = lookup(key_var);
            let url = lookup(url_var);
            if key.is_none() && url.is_none() && !self.processors.contains_key(label) {
                continue;
            }
            let opts = self.processors.entry(label.to_string()).or_default();
            if opts.api_key.is_none() {
                opts.api_key = key;
            }
            if opts.base_url.is_none() {
                opts.base_url = url;
            }
        }
        self
    }

    /// Options for `label`, or defaults when the config does not mention it.
    pub fn processor_options(&self, label: &str) -> ProcessorOptions {
        self.processors.get(label).cloned().unwrap_or_default()
    }
}
