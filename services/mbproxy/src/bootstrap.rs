//! Process bootstrap
//!
//! Command-line parsing and logging setup. Arguments override whatever the
//! configuration file and environment provided.

use std::path::PathBuf;

use clap::Parser;
use common::LogConfig;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};

/// Command-line arguments for mbproxy
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mbproxy",
    version = env!("CARGO_PKG_VERSION"),
    about = "Transparent Modbus-TCP proxy for servers that accept a single client",
    long_about = None
)]
pub struct Args {
    /// Upstream Modbus server as host:port
    #[arg(value_name = "SERVER:PORT")]
    pub upstream: String,

    /// Port to listen on for client connections [default: 2502]
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Interface to listen on [default: all interfaces]
    #[arg(short = 'i', long)]
    pub interface: Option<String>,

    /// Enable verbose per-frame logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Optional YAML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Directory for daily rolling log files
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - print the effective configuration and exit
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Apply command-line values on top of a loaded configuration
    pub fn apply_to(&self, config: &mut ProxyConfig) {
        config.upstream.address = self.upstream.clone();
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(interface) = &self.interface {
            config.listen.interface = interface.clone();
        }

        if self.debug {
            config.logging.level = "debug".to_string();
        } else if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }

        if let Some(dir) = &self.log_dir {
            config.logging.dir = Some(dir.display().to_string());
        }
    }

    pub fn log_config(&self, config: &ProxyConfig) -> LogConfig {
        LogConfig {
            service_name: "mbproxy".to_string(),
            level: config.logging.level.clone(),
            log_dir: config.logging.dir.as_ref().map(PathBuf::from),
            ansi: !self.no_color,
        }
    }
}

/// Initialize logging from the effective configuration
pub fn initialize_logging(args: &Args, config: &ProxyConfig) -> ProxyResult<()> {
    common::logging::init_with_config(args.log_config(config))
        .map_err(|e| ProxyError::config(format!("failed to initialize logging: {}", e)))
}
