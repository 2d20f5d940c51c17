//! Configuration system for Convoy fleet instances.
//!
//! Provides TOML-based configuration with:
//! - Instance identity (`[instance]`: type, optional fixed host id)
//! - Scaling mode and broker connection (`[scaling]`)
//! - Multi-main leader election timing (`[multi_main]`)
//! - Task broker offer validity and default deadlines (`[broker]`)
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
