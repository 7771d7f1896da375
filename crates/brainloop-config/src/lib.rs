//! Configuration loading for the brainloop worker.
//!
//! This crate loads a single `brainloop.toml` from the current working
//! directory, with environment-variable fallback for secrets and a couple
//! of operator toggles (see [`env`]). This is a deliberately narrower
//! precedence chain than a multi-tenant desktop product needs: a single
//! local worker process has one workspace and one operator, so file and
//! env layering is enough.
//!
//! This crate has no dependencies on other internal brainloop crates. It
//! only depends on `serde`, `toml`, `thiserror`, `tracing`, and
//! `directories`.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod env;
pub mod error;
pub mod loader;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{Config, CompletionConfig, ExecutorConfig, LifecycleConfig, RateLimiterConfig};

use std::path::Path;

impl Config {
    /// Load configuration from `{dir}/brainloop.toml`, falling back to
    /// defaults, then applying environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file exists but cannot be read or
    /// parsed.
    pub fn load(dir: &Path) -> ConfigResult<Self> {
        loader::load(dir)
    }

    /// Load configuration from an explicit file path, with no directory
    /// discovery.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
