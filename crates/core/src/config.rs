//! Runtime configuration.
//!
//! Configuration is read once per process. [`get`] falls back to
//! [`DispatchConfig::from_env`] if nothing was installed explicitly.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `DYNLAYER_SHOW_DISPATCH_TRACE` | `show_dispatch_trace` |
//! | `DYNLAYER_CHECK_UNWRAPPED` | `check_unwrapped_at_base` |

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Switches for diagnostics in the dispatch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Log layer stacks and entering/leaving the interception subsystem at
    /// `debug` level.
    pub show_dispatch_trace: bool,
    /// Before the last layer hands an operation to the base runtime, assert
    /// that no tagged or batched wrapper is left among the arguments.
    pub check_unwrapped_at_base: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            show_dispatch_trace: false,
            check_unwrapped_at_base: cfg!(debug_assertions),
        }
    }
}

impl DispatchConfig {
    /// Read the configuration from environment variables, keeping defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_flag("DYNLAYER_SHOW_DISPATCH_TRACE") {
            config.show_dispatch_trace = v;
        }
        if let Some(v) = env_flag("DYNLAYER_CHECK_UNWRAPPED") {
            config.check_unwrapped_at_base = v;
        }
        config
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    parse_flag(&raw)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

static CONFIG: OnceLock<DispatchConfig> = OnceLock::new();

/// Install the process configuration. Returns `false` if one was already set.
pub fn install(config: DispatchConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// The process configuration.
pub fn get() -> &'static DispatchConfig {
    CONFIG.get_or_init(DispatchConfig::from_env)
}
