use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config;
use crate::config::types::{AppConfig, ChatMode};

#[derive(Parser, Debug)]
#[command(name = "sshchat", version, about = "Multi-user chat over SSH")]
pub struct Cli {
    /// Path to configuration file (also settable via SSHCHAT_CONFIG env var).
    /// Built-in defaults are used when omitted.
    #[arg(short, long, env = "SSHCHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listening port override
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrent sessions override
    #[arg(long)]
    pub instances: Option<usize>,

    /// What sessions do with each line
    #[arg(long, value_enum)]
    pub mode: Option<ChatMode>,

    /// Announce the listening port at info level
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration file
    CheckConfig,
    /// Print the users and key fingerprints an authorized keys file yields
    Fingerprint {
        /// Key file to read
        #[arg(short, long)]
        key: PathBuf,
    },
}

impl Cli {
    /// Load the config file (or defaults) and apply command line overrides.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config(path)?,
            None => AppConfig::default(),
        };
        self.apply_overrides(&mut cfg);
        config::validate_config(&cfg)?;
        Ok(cfg)
    }

    pub fn apply_overrides(&self, cfg: &mut AppConfig) {
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(instances) = self.instances {
            cfg.server.instances = instances;
        }
        if let Some(mode) = self.mode {
            cfg.chat.mode = mode;
        }
        if self.verbose {
            cfg.server.verbose = true;
        }
    }

    /// Effective log level: the flag, else the config value.
    pub fn log_level(&self, cfg: &AppConfig) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| cfg.logging.level.to_string())
    }
}
