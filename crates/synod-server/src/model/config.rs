//! Configuration loading for the Synod server
//!
//! Sources, lowest precedence first: built-in defaults, the optional YAML
//! file, `SYNOD_`-prefixed environment variables, command line flags.

use clap::Parser;
use config::{Config, Environment, File};
use tracing::Level;

use synod_core::config::{CLUSTER_SIZE, DISPATCH_POLICY};
use synod_core::Configuration;

use crate::startup::LoggingConfig;

pub const LOGGING_DIR: &str = "logging.dir";
pub const LOGGING_LEVEL: &str = "logging.level";
pub const LOGGING_CONSOLE: &str = "logging.console";
pub const LOGGING_FILE: &str = "logging.file";

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "synod-server", version, about = "Drive an in-process Synod cluster over JSON lines")]
pub struct Cli {
    /// Configuration file (YAML); missing files are ignored
    #[arg(short = 'c', long = "config", env = "SYNOD_CONFIG", default_value = "conf/synod.yml")]
    pub config: String,
    /// Number of members
    #[arg(short = 'n', long = "size")]
    pub size: Option<u32>,
    /// Initial dispatch policy
    #[arg(short = 'p', long = "policy")]
    pub policy: Option<String>,
    /// Log level for console and files
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    /// Directory for log files; enables file logging
    #[arg(long = "log-dir")]
    pub log_dir: Option<String>,
}

/// Build the layered configuration
pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder()
        .add_source(File::with_name(&cli.config).required(false))
        .add_source(
            Environment::with_prefix("SYNOD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    if let Some(size) = cli.size {
        builder = builder.set_override(CLUSTER_SIZE, i64::from(size))?;
    }
    if let Some(policy) = &cli.policy {
        builder = builder.set_override(DISPATCH_POLICY, policy.as_str())?;
    }
    if let Some(level) = &cli.log_level {
        builder = builder.set_override(LOGGING_LEVEL, level.as_str())?;
    }
    if let Some(dir) = &cli.log_dir {
        builder = builder
            .set_override(LOGGING_DIR, dir.as_str())?
            .set_override(LOGGING_FILE, true)?;
    }

    Ok(Configuration::from_config(builder.build()?))
}

pub fn logging_config(configuration: &Configuration) -> LoggingConfig {
    let config = &configuration.config;
    LoggingConfig::from_config(
        config.get_string(LOGGING_DIR).ok(),
        config.get_bool(LOGGING_CONSOLE).unwrap_or(true),
        config.get_bool(LOGGING_FILE).unwrap_or(false),
        config
            .get_string(LOGGING_LEVEL)
            .unwrap_or_else(|_| Level::INFO.to_string()),
    )
}
