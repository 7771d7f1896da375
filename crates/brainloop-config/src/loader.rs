//! Configuration file discovery and loading.

use std::path::Path;

use tracing::debug;

use crate::env::apply_env_overrides;
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Config files larger than this are refused, to avoid reading an
/// accidentally-huge file into memory.
const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;

/// Load configuration from `{dir}/brainloop.toml`, falling back to defaults
/// if the file does not exist, then apply environment overrides.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file exists but cannot be read or
/// parsed.
pub fn load(dir: &Path) -> ConfigResult<Config> {
    let path = dir.join("brainloop.toml");
    let mut config = match read_file(&path)? {
        Some(config) => config,
        None => {
            debug!(path = %path.display(), "brainloop.toml not found, using defaults");
            Config::default()
        }
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration from an explicit file path, with no directory
/// discovery. Still applies environment overrides.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let mut config = read_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
    })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

fn read_file(path: &Path) -> ConfigResult<Option<Config>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source,
            });
        }
    };

    if metadata.len() > MAX_CONFIG_FILE_BYTES {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_BYTES} byte limit",
                metadata.len()
            ),
        });
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
        path: path.display().to_string(),
        source,
    })?;

    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_partial_overrides_and_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("brainloop.toml")).unwrap();
        writeln!(file, "workspace_root = \"/tmp/demo\"").unwrap();
        writeln!(file, "[executor]").unwrap();
        writeln!(file, "timeout_secs = 30").unwrap();
        drop(file);

        let config = load(dir.path()).unwrap();
        assert_eq!(config.workspace_root, Path::new("/tmp/demo"));
        assert_eq!(config.executor.timeout_secs, 30);
        assert_eq!(config.executor.max_output_bytes, Config::default().executor.max_output_bytes);
    }

    #[test]
    fn rejects_oversized_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brainloop.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        let padding = "# ".to_string() + &"x".repeat(MAX_CONFIG_FILE_BYTES as usize + 1);
        writeln!(file, "{padding}").unwrap();
        drop(file);

        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("brainloop.toml")).unwrap();
        writeln!(file, "not valid = [[[").unwrap();
        drop(file);

        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
