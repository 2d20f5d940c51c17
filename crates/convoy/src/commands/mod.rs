//! CLI command handlers.

use std::path::Path;

use anyhow::Result;
use convoy_config::LoadedConfig;

pub mod config;
pub mod publish;
pub mod start;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Load configuration from an explicit file, or by layered discovery.
///
/// Layer warnings are printed to stderr; they never abort the command.
pub(crate) fn load(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let loaded = match explicit {
        Some(path) => {
            let config = convoy_config::load_config_file(path)?;
            config.validate()?;
            LoadedConfig {
                config,
                sources: vec![convoy_config::discovery::ConfigSource {
                    path: path.to_path_buf(),
                    loaded: true,
                }],
                warnings: Vec::new(),
            }
        }
        None => convoy_config::load_config(None)?,
    };

    for warning in &loaded.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(loaded)
}
