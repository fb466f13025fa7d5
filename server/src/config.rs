//! Startup configuration.
//!
//! Values come from three layers: built-in defaults, an optional TOML file
//! named with `--config`, then command-line flags. A later layer overrides an
//! earlier one field by field. The result is validated once and never changes
//! while the server runs.

use clap::Parser;
use serde::Deserialize;
use shared::{DEFAULT_CHUNK_SIZE, DEFAULT_TICK_RATE, HEARTBEAT_INTERVAL_MS};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BCRYPT_COST: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug, Default)]
#[clap(author, version, about = "Authoritative tile world server")]
pub struct Args {
    /// TOML file with server settings
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// IP address to bind to
    #[clap(short = 'H', long)]
    pub host: Option<String>,
    /// Port to listen on
    #[clap(short, long)]
    pub port: Option<u16>,
    /// Secret used to sign and verify auth tokens
    #[clap(short, long)]
    pub secret: Option<String>,
    /// Directory holding the world database
    #[clap(short, long)]
    pub data_dir: Option<PathBuf>,
    /// Tiles along each side of a chunk
    #[clap(long)]
    pub chunk_size: Option<usize>,
    /// World seed, random if unset and none is stored yet
    #[clap(long)]
    pub seed: Option<u64>,
    /// Snapshots broadcast per second
    #[clap(short, long)]
    pub tick_rate: Option<u32>,
    /// Milliseconds between keep-alive probes
    #[clap(long)]
    pub heartbeat_ms: Option<u64>,
    #[clap(long)]
    pub bcrypt_cost: Option<u32>,
    /// Outbound frames buffered per session before it counts as lagging
    #[clap(long)]
    pub channel_capacity: Option<usize>,
}

/// Shape of the optional TOML file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    pub seed: Option<u64>,
    pub tick_rate: Option<u32>,
    pub heartbeat_ms: Option<u64>,
    pub bcrypt_cost: Option<u32>,
    pub channel_capacity: Option<usize>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secret: String,
    pub data_dir: PathBuf,
    pub chunk_size: usize,
    pub seed: Option<u64>,
    pub tick_rate: u32,
    pub heartbeat_interval: Duration,
    pub bcrypt_cost: u32,
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            secret: String::new(),
            data_dir: PathBuf::from("data"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            seed: None,
            tick_rate: DEFAULT_TICK_RATE,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            channel_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Reads the file named by `--config`, if any, and merges it with `args`.
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: Args, file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: args.host.or(file.host).unwrap_or(defaults.host),
            port: args.port.or(file.port).unwrap_or(defaults.port),
            secret: args.secret.or(file.secret).unwrap_or(defaults.secret),
            data_dir: args.data_dir.or(file.data_dir).unwrap_or(defaults.data_dir),
            chunk_size: args
                .chunk_size
                .or(file.chunk_size)
                .unwrap_or(defaults.chunk_size),
            seed: args.seed.or(file.seed),
            tick_rate: args.tick_rate.or(file.tick_rate).unwrap_or(defaults.tick_rate),
            heartbeat_interval: args
                .heartbeat_ms
                .or(file.heartbeat_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            bcrypt_cost: args
                .bcrypt_cost
                .or(file.bcrypt_cost)
                .unwrap_or(defaults.bcrypt_cost),
            channel_capacity: args
                .channel_capacity
                .or(file.channel_capacity)
                .unwrap_or(defaults.channel_capacity),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid(
                "a token secret is required (--secret or `secret` in the config file)".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".to_string()));
        }
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be at least 1".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_ms must be at least 1".to_string()));
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::Invalid(format!(
                "bcrypt_cost must be between 4 and 31, got {}",
                self.bcrypt_cost
            )));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
