//! Configuration module for framecheck.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::verifier::VerifyMode;

/// Command-line arguments for the transfer harness
#[derive(Parser, Debug, Default)]
#[command(name = "framecheck")]
#[command(author = "framecheck authors")]
#[command(version = "0.1.0")]
#[command(about = "Stream framed chunks through an echo/relay server and verify them", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Host to connect (e.g., localhost:3000)
    #[arg(short = 'a', long)]
    pub addr: Option<String>,

    /// Nominal buffer (chunk) size in bytes
    #[arg(short = 'b', long)]
    pub buf_size: Option<usize>,

    /// Buffer size variation (uniform +/- spread)
    #[arg(long = "buf-size-var")]
    pub buf_size_var: Option<usize>,

    /// Capacity of every queue between stages
    #[arg(short = 'c', long)]
    pub channel_size: Option<usize>,

    /// Verbose per-chunk logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Read chunks from this file instead of generating them
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Write received chunks to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Wall-clock budget for synthetic generation, in seconds
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// Size budget for synthetic generation, in bytes
    #[arg(long)]
    pub total_size: Option<u64>,

    /// Verify echoed chunks by content or by totals only
    #[arg(long, value_enum)]
    pub verify: Option<VerifyMode>,

    /// Seed for the synthetic generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Set TCP_NODELAY on the connection
    #[arg(long)]
    pub nodelay: Option<bool>,

    /// SO_SNDBUF size in bytes
    #[arg(long)]
    pub send_buffer_size: Option<usize>,

    /// SO_RCVBUF size in bytes
    #[arg(long)]
    pub recv_buffer_size: Option<usize>,

    /// Run the bundled echo relay on this address instead of the client
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Destination address
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            nodelay: default_nodelay(),
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Transfer-related configuration
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    #[serde(default = "default_buf_size_var")]
    pub buf_size_var: usize,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    #[serde(default)]
    pub verbose: bool,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    /// Seconds
    pub duration: Option<f64>,
    pub total_size: Option<u64>,
    #[serde(default)]
    pub verify: VerifyMode,
    pub seed: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buf_size: default_buf_size(),
            buf_size_var: default_buf_size_var(),
            channel_size: default_channel_size(),
            verbose: false,
            input: None,
            output: None,
            duration: None,
            total_size: None,
            verify: VerifyMode::default(),
            seed: None,
        }
    }
}

/// Echo relay configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to when running the relay
    pub listen: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_addr() -> String {
    "localhost:3000".to_string()
}

fn default_nodelay() -> bool {
    true
}

fn default_buf_size() -> usize {
    300
}

fn default_buf_size_var() -> usize {
    100
}

fn default_channel_size() -> usize {
    1
}

fn default_duration() -> Duration {
    Duration::from_secs(1)
}

fn default_max_connections() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub nodelay: bool,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub buf_size: usize,
    pub buf_size_var: usize,
    pub channel_size: usize,
    pub verbose: bool,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub duration: Option<Duration>,
    pub total_size: Option<u64>,
    pub verify: VerifyMode,
    pub seed: Option<u64>,
    pub listen: Option<String>,
    pub max_connections: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    /// Build and validate the configuration from already-parsed arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let transfer = toml_config.transfer;
        let total_size = cli.total_size.or(transfer.total_size);

        // A size budget alone drives generation; otherwise fall back to the
        // default wall-clock budget.
        let duration = cli
            .duration
            .or(transfer.duration)
            .map(Duration::from_secs_f64)
            .or(if total_size.is_none() {
                Some(default_duration())
            } else {
                None
            });

        let verbose = cli.verbose || transfer.verbose;
        let log_level = if cli.log_level != "info" && !cli.log_level.is_empty() {
            cli.log_level
        } else if verbose && toml_config.logging.level == "info" {
            "debug".to_string()
        } else {
            toml_config.logging.level
        };

        Config {
            addr: cli.addr.unwrap_or(toml_config.connection.addr),
            nodelay: cli.nodelay.unwrap_or(toml_config.connection.nodelay),
            send_buffer_size: cli
                .send_buffer_size
                .or(toml_config.connection.send_buffer_size),
            recv_buffer_size: cli
                .recv_buffer_size
                .or(toml_config.connection.recv_buffer_size),
            buf_size: cli.buf_size.unwrap_or(transfer.buf_size),
            buf_size_var: cli.buf_size_var.unwrap_or(transfer.buf_size_var),
            channel_size: cli.channel_size.unwrap_or(transfer.channel_size),
            verbose,
            input: cli.input.or(transfer.input),
            output: cli.output.or(transfer.output),
            duration,
            total_size,
            verify: cli.verify.unwrap_or(transfer.verify),
            seed: cli.seed.or(transfer.seed),
            listen: cli.listen.or(toml_config.server.listen),
            max_connections: toml_config.server.max_connections,
            log_level,
        }
    }

    /// Reject settings the pipeline cannot honor.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.channel_size == 0 {
            return Err(ConfigError::Invalid(
                "channel size must be at least 1".to_string(),
            ));
        }
        if self.buf_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer size must be at least 1".to_string(),
            ));
        }
        if self.input.is_none() && self.buf_size_var >= self.buf_size {
            return Err(ConfigError::Invalid(format!(
                "buffer size variation {} must be smaller than buffer size {}",
                self.buf_size_var, self.buf_size
            )));
        }
        let max_chunk = self.buf_size.saturating_add(self.buf_size_var);
        if max_chunk > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "chunks of up to {max_chunk} bytes do not fit the frame length field"
            )));
        }
        if let Some(duration) = self.duration {
            if duration.is_zero() && self.total_size.is_none() {
                return Err(ConfigError::Invalid(
                    "duration must be positive".to_string(),
                ));
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Immutable snapshot handed to every stage.
    ///
    /// `total_size` is the transfer target when it is known before the run
    /// starts (input file length or a pure size budget).
    pub fn condition(&self, total_size: Option<u64>) -> TransferCondition {
        TransferCondition {
            total_size,
            buf_size: self.buf_size,
            buf_size_var: self.buf_size_var,
            verbose: self.verbose,
        }
    }

    /// Whether echoed data is read back from the connection.
    ///
    /// Forwarding a file with no output destination is send-only.
    pub fn receives(&self) -> bool {
        self.input.is_none() || self.output.is_some()
    }
}

/// Transfer parameters shared read-only by all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCondition {
    pub total_size: Option<u64>,
    pub buf_size: usize,
    pub buf_size_var: usize,
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.connection.addr, "localhost:3000");
        assert!(config.connection.nodelay);
        assert_eq!(config.transfer.buf_size, 300);
        assert_eq!(config.transfer.buf_size_var, 100);
        assert_eq!(config.transfer.channel_size, 1);
        assert_eq!(config.transfer.verify, VerifyMode::Content);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [connection]
            addr = "10.0.0.1:7000"
            nodelay = false
            send_buffer_size = 65536

            [transfer]
            buf_size = 4096
            buf_size_var = 1024
            channel_size = 16
            verify = "totals"
            duration = 2.5
            seed = 7

            [server]
            listen = "0.0.0.0:7000"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.addr, "10.0.0.1:7000");
        assert!(!config.connection.nodelay);
        assert_eq!(config.connection.send_buffer_size, Some(65536));
        assert_eq!(config.transfer.buf_size, 4096);
        assert_eq!(config.transfer.channel_size, 16);
        assert_eq!(config.transfer.verify, VerifyMode::Totals);
        assert_eq!(config.transfer.duration, Some(2.5));
        assert_eq!(config.transfer.seed, Some(7));
        assert_eq!(config.server.listen.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "framecheck",
            "-a",
            "127.0.0.1:9000",
            "-b",
            "512",
            "-c",
            "4",
            "--verify",
            "totals",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [connection]
            addr = "10.0.0.1:7000"
            [transfer]
            buf_size = 4096
            buf_size_var = 8
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.buf_size, 512);
        assert_eq!(config.buf_size_var, 8);
        assert_eq!(config.channel_size, 4);
        assert_eq!(config.verify, VerifyMode::Totals);
        assert_eq!(config.duration, Some(Duration::from_secs(1)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_size_budget_disables_default_duration() {
        let cli = CliArgs::parse_from(["framecheck", "--total-size", "10000"]);
        let config = Config::merge(cli, TomlConfig::default());
        assert_eq!(config.total_size, Some(10000));
        assert_eq!(config.duration, None);
    }

    #[test]
    fn test_verbose_raises_log_level() {
        let cli = CliArgs::parse_from(["framecheck", "-v"]);
        let config = Config::merge(cli, TomlConfig::default());
        assert!(config.verbose);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.channel_size = 0;
        assert!(config.validate().is_err());
        config.channel_size = 1;

        config.buf_size_var = config.buf_size;
        assert!(config.validate().is_err());

        // Variation is irrelevant when chunks come from a file.
        config.input = Some(PathBuf::from("input.bin"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_errors_surface_as_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let cli = CliArgs::parse_from(["framecheck", "--config", missing.to_str().unwrap()]);
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Config(ConfigError::FileRead { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[transfer]\nbuf_size = \"big\"\n").unwrap();
        let cli = CliArgs::parse_from(["framecheck", "--config", bad.to_str().unwrap()]);
        assert!(matches!(
            Config::from_args(cli).unwrap_err(),
            crate::error::Error::Config(ConfigError::TomlParse { .. })
        ));

        let cli = CliArgs::parse_from(["framecheck", "-c", "0"]);
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Config(ConfigError::Invalid(_))
        ));
        assert_eq!(err.to_string(), "invalid configuration: channel size must be at least 1");
    }

    #[test]
    fn test_receive_side_selection() {
        let mut config = Config::default();
        assert!(config.receives());

        config.input = Some(PathBuf::from("input.bin"));
        assert!(!config.receives());

        config.output = Some(PathBuf::from("output.bin"));
        assert!(config.receives());
    }

    #[test]
    fn test_condition_snapshot() {
        let config = Config::default();
        let cond = config.condition(Some(1000));
        assert_eq!(cond.total_size, Some(1000));
        assert_eq!(cond.buf_size, 300);
        assert_eq!(cond.buf_size_var, 100);
        assert!(!cond.verbose);
    }
}
