//! Environment variable fallback resolution.
//!
//! Secrets and a couple of operator toggles are never read from
//! `brainloop.toml` directly; they are applied on top of the file-loaded
//! [`crate::Config`] by [`apply_env_overrides`].

use std::path::PathBuf;

use crate::types::Config;

/// Env var holding the completion API key, tried in order; the first one
/// present wins.
const API_KEY_VARS: &[&str] = &["BRAINLOOP_API_KEY", "ANTHROPIC_API_KEY", "CEREBRAS_API_KEY"];

/// Overrides `config.workspace_root` if set.
const WORKSPACE_ROOT_VAR: &str = "BRAINLOOP_WORKSPACE_ROOT";

/// Overrides `config.require_project_name_in_cwd` if set to `"0"`/`"false"`
/// or `"1"`/`"true"` (case-insensitive).
const REQUIRE_PROJECT_NAME_VAR: &str = "BRAINLOOP_REQUIRE_PROJECT_NAME";

/// Resolve the completion API key from the environment.
#[must_use]
pub fn resolve_api_key() -> Option<String> {
    API_KEY_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply environment-variable overrides on top of a file-loaded config.
pub fn apply_env_overrides(config: &mut Config) {
    config.completion.api_key = resolve_api_key();

    if let Ok(root) = std::env::var(WORKSPACE_ROOT_VAR) {
        if !root.is_empty() {
            config.workspace_root = PathBuf::from(root);
        }
    }

    if let Ok(raw) = std::env::var(REQUIRE_PROJECT_NAME_VAR) {
        if let Some(parsed) = parse_bool_env(&raw) {
            config.require_project_name_in_cwd = parsed;
        }
    }
}
