use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub conductor: ConductorConfig,
    pub demo: DemoConfig,
}

impl AppConfig {
    /// Reads a TOML configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// How a failed movement affects the movements declared after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Every movement is its own failure domain. Later movements still run
    /// unless they opt into `abortOnPriorFailure`.
    #[default]
    IndependentMovements,
    /// The first failed movement skips every later movement.
    AbortSequence,
}

/// Configuration specific to the conductor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub failure_policy: FailurePolicy,
    /// Emit a diff line before/after every beat.
    pub log_baton_diffs: bool,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::IndependentMovements,
            log_baton_diffs: true,
            event_capacity: 256,
        }
    }
}

/// Settings for the built-in demo plugin run by the command line front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub topic: String,
    pub default_theme: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            topic: "app.theme.change".to_string(),
            default_theme: "dark".to_string(),
        }
    }
}
