//! Governance configuration loaded from `governance.toml`.
//!
//! A missing file is not an error: every key has a default.

use crate::core::error::GovernanceError;
use crate::core::formatter::{EncodingStrictness, FormatOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "governance.toml";

pub const DEFAULT_PLACEHOLDER: &str = "(not set)";
pub const DEFAULT_SUMMARY_WORD_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GovernanceConfig {
    /// How non-ASCII input is handled by the formatter.
    pub encoding: EncodingStrictness,
    /// Body rendered for absent sections.
    pub placeholder: String,
    /// Advisory word ceiling for canonical summaries.
    pub summary_word_limit: usize,
    /// Append conference outcomes to `conference.events.jsonl`.
    pub audit: bool,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            encoding: EncodingStrictness::Transliterate,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            summary_word_limit: DEFAULT_SUMMARY_WORD_LIMIT,
            audit: true,
        }
    }
}

impl GovernanceConfig {
    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            strictness: self.encoding,
            placeholder: self.placeholder.clone(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, GovernanceError> {
        let config: GovernanceConfig =
            toml::from_str(content).map_err(|e| GovernanceError::ConfigError(e.to_string()))?;
        if !config.placeholder.is_ascii() || config.placeholder.trim().is_empty() {
            return Err(GovernanceError::ConfigError(
                "placeholder must be non-empty 7-bit ASCII".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, GovernanceError> {
        toml::to_string_pretty(self).map_err(|e| GovernanceError::ConfigError(e.to_string()))
    }
}

/// Load `governance.toml` from the store root, falling back to defaults.
pub fn load_config(store_root: &Path) -> Result<GovernanceConfig, GovernanceError> {
    let path = store_root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(GovernanceConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(GovernanceError::IoError)?;
    GovernanceConfig::parse(&content)
}
