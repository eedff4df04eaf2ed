//! Configuration loading with optional-file semantics.
//!
//! An explicitly named config file must exist and parse; the implicit
//! default location (`./passage.toml`) is best-effort: a missing file yields
//! defaults, a malformed one warns to stderr and yields defaults.

use crate::{PassageConfig, SettingsError};
use std::path::{Path, PathBuf};

/// Loads `PassageConfig` from an explicit or the conventional location.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration.
    ///
    /// With `Some(path)` the file must exist and parse. With `None` the
    /// conventional `./passage.toml` is consulted if present; a parse error
    /// there warns and falls back to defaults so a stale file does not block
    /// startup.
    ///
    /// # Errors
    /// * `SettingsError::Io` / `SettingsError::Parse` - only for an
    ///   explicitly provided path.
    pub fn load(path: Option<&Path>) -> Result<PassageConfig, SettingsError> {
        match path {
            Some(path) => PassageConfig::load(path),
            None => Ok(Self::load_optional(&Self::default_config_path())),
        }
    }

    /// The conventional config file location, relative to the working
    /// directory.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("passage.toml")
    }

    fn load_optional(path: &Path) -> PassageConfig {
        if !path.exists() {
            return PassageConfig::default();
        }
        match PassageConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // A stale file in the working directory must not block startup.
                eprintln!("passage-settings: warning: failed to parse {path:?}: {err}");
                PassageConfig::default()
            }
        }
    }
}
