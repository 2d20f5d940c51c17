//! Finding and layering `convoy` config files.
//!
//! Layers, lowest precedence first:
//! 1. `<config dir>/config.toml`, where the config dir is `CONVOY_CONFIG_DIR`
//!    or the platform default (`~/.config/convoy` on Linux)
//! 2. `convoy.toml` in the project directory
//! 3. command-line flags, applied by the binary
//!
//! Layers merge section by section: a section present in a later layer
//! replaces the whole section from an earlier one.

use std::path::{Path, PathBuf};

use crate::{ConfigError, ConvoyConfig, Result};

/// Project-local file name.
const PROJECT_CONFIG_FILE: &str = "convoy.toml";

/// File name inside the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

const APP_NAME: &str = "convoy";

/// Environment variable to override the user config directory.
const CONFIG_DIR_ENV: &str = "CONVOY_CONFIG_DIR";

/// One candidate layer and whether it contributed.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// False when the file is absent or failed to parse.
    pub loaded: bool,
}

/// Merged configuration plus the provenance of each layer.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ConvoyConfig,
    /// Every candidate layer, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Layers that existed but could not be read or parsed.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of the layers that contributed.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Discover, merge, and validate every layer.
///
/// `project_dir` defaults to the working directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with the user config directory pinned.
///
/// `config_dir` overrides both `CONVOY_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = ConvoyConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    config.validate()?;

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Parse one file, bypassing discovery and validation.
pub fn load_config_file(path: &Path) -> Result<ConvoyConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    ConvoyConfig::from_toml(&contents)
}

/// Save configuration to a file, creating parent directories as needed.
pub fn save_config(config: &ConvoyConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// Path of the user config file.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// User config directory for convoy.
///
/// Checks `CONVOY_CONFIG_DIR` first, then falls back to the platform default.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Merge `path` into `config` if it exists. A broken file becomes a warning.
fn load_layer(config: &mut ConvoyConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("ignoring {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}
