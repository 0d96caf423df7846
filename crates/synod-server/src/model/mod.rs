pub mod config;

pub use self::config::{Cli, load_configuration, logging_config};
