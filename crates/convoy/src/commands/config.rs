//! Config command - configuration management.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};

use convoy_config::ConvoyConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration with defaults applied
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./convoy.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(),
        ConfigCommand::Init { local } => cmd_init(local),
        ConfigCommand::Path => cmd_path(),
    }
}

/// Every section filled in, so defaults are visible.
fn resolved(config: &ConvoyConfig) -> ConvoyConfig {
    ConvoyConfig {
        instance: Some(config.instance()),
        scaling: Some(config.scaling()),
        multi_main: Some(config.multi_main()),
        broker: Some(config.broker()),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = super::load(None)?;
    let config = resolved(&loaded.config);

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("# Convoy Configuration\n");
    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)\n");
    } else {
        for source in &sources {
            println!("# from {}", source.display());
        }
        println!();
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_which() -> Result<()> {
    let loaded = super::load(None)?;
    println!("Config files (lowest precedence first):");
    for source in &loaded.sources {
        let marker = if source.loaded { "loaded" } else { "missing" };
        println!("  [{}] {}", marker, source.path.display());
    }
    Ok(())
}

fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        std::path::PathBuf::from("convoy.toml")
    } else {
        match convoy_config::user_config_path() {
            Some(path) => path,
            None => bail!("could not determine the user config directory"),
        }
    };
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    convoy_config::save_config(&resolved(&ConvoyConfig::new()), &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_path() -> Result<()> {
    match convoy_config::user_config_path() {
        Some(path) => println!("{}", path.display()),
        None => bail!("could not determine the user config directory"),
    }
    Ok(())
}
