use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mynd_rpi_link.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub uart: UartConfig,
    #[serde(default)]
    pub moode: MoodeConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UartConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Read and write timeout, in seconds.
    #[serde(default = "default_uart_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request HTTP timeout, in seconds.
    #[serde(default = "default_api_timeout")]
    pub api_timeout: f64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Seconds between playback-state polls; never less than one second.
    #[serde(default = "default_streaming_poll_interval")]
    pub streaming_poll_interval: f64,
    #[serde(default = "default_mpd_port")]
    pub mpd_port: u16,
    #[serde(default = "default_mpd_socket")]
    pub mpd_socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default = "default_poweroff_command")]
    pub poweroff_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Log for the system journal (no colour, no timestamps) instead of the console.
    #[serde(default = "default_use_syslog")]
    pub use_syslog: bool,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baudrate: default_baudrate(),
            timeout: default_uart_timeout(),
        }
    }
}

impl Default for MoodeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_timeout: default_api_timeout(),
            retry_count: default_retry_count(),
            streaming_poll_interval: default_streaming_poll_interval(),
            mpd_port: default_mpd_port(),
            mpd_socket: default_mpd_socket(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            poweroff_command: default_poweroff_command(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            use_syslog: default_use_syslog(),
        }
    }
}

fn default_device() -> String {
    "/dev/serial0".to_string()
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_uart_timeout() -> f64 {
    0.2
}

fn default_base_url() -> String {
    "http://localhost".to_string()
}

fn default_api_timeout() -> f64 {
    5.0
}

fn default_retry_count() -> u32 {
    3
}

fn default_streaming_poll_interval() -> f64 {
    5.0
}

fn default_mpd_port() -> u16 {
    6600
}

fn default_mpd_socket() -> PathBuf {
    PathBuf::from("/run/mpd/socket")
}

fn default_poweroff_command() -> String {
    "sudo poweroff".to_string()
}

fn default_level() -> String {
    "INFO".to_string()
}

fn default_use_syslog() -> bool {
    true
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl UartConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout)
    }
}

impl MoodeConfig {
    pub fn api_timeout(&self) -> Duration {
        seconds(self.api_timeout)
    }

    pub fn streaming_poll_interval(&self) -> Duration {
        seconds(self.streaming_poll_interval.max(1.0))
    }
}

impl LoggingConfig {
    /// The configured level as an `EnvFilter` directive (`INFO` -> `info`).
    /// Python-style `WARNING` and `CRITICAL` map onto `warn` and `error`.
    pub fn filter_directive(&self) -> &'static str {
        match self.level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

impl Config {
    /// Load the TOML file at `path`.  Missing sections and keys take their
    /// defaults; a missing file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        tracing::debug!(?config, "configuration parsed");
        Ok(config)
    }
}
