//! Command handler modules for ivp-cli.
//!
//! Shared wiring used by multiple command paths lives here. Command-specific
//! logic lives in the submodules.

pub mod db;
pub mod poll;
pub mod replay;

use anyhow::{Context, Result};
use ivp_config::Settings;
use ivp_normalize::NormalizationRules;

/// Loads the normalization ruleset from `settings.normalization_rules_path`,
/// falling back to the workspace's built-in defaults if the file is absent.
/// A ruleset must always be available; this is the CLI's fatal-vs-default
/// policy rather than the engine's.
pub fn load_rules(settings: &Settings) -> Result<NormalizationRules> {
    let path = std::path::Path::new(&settings.normalization_rules_path);
    if !path.exists() {
        tracing::warn!(path = %settings.normalization_rules_path, "normalization rules file not found, using built-in defaults");
        return Ok(NormalizationRules::builtin_defaults());
    }
    let loaded = ivp_config::load_rules_file(path).with_context(|| format!("load normalization rules from {path:?}"))?;
    Ok(NormalizationRules::from_json(&loaded.rules_json))
}
