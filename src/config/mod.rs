use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Searched in this order when no file is given on the command line
pub const CONFIG_PATHS: [&str; 2] = ["config/meter-setup.yaml", "meter-setup.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse config file {path:?}: {source}")]
    Parse { path: PathBuf, source: serde_yml::Error },
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Response timeout from a number of seconds, as given in the file or on the command line
pub fn timeout_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid { field: "timeout", reason };
    if secs <= 0.0 {
        return Err(invalid(format!("{secs} s, expected a positive number of seconds")));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(format!("{secs} s, {e}")))
}

fn timeout_secs_default() -> f64 { return 2.0 }
fn tcp_port_default() -> u16 { return 502 }
fn baudrate_default() -> u32 { return 9600 }
fn unit_id_default() -> u8 { return 1 }
fn gateway_framing_default() -> String { return "tcp".to_string() }
fn reconnect_delay_ms_default() -> u64 { return 1000 }

fn voltage_nominals_default() -> Vec<f64> { return vec![115.0, 230.0] }
fn voltage_tolerance_default() -> f64 { return 0.1 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct VoltageConfig {
    #[serde(default="voltage_nominals_default")]
    pub nominals: Vec<f64>,
    /// Relative, 0.1 accepts 207-253 V around 230 V
    #[serde(default="voltage_tolerance_default")]
    pub tolerance: f64,
}

fn voltage_default() -> VoltageConfig { return VoltageConfig { nominals: voltage_nominals_default(), tolerance: voltage_tolerance_default() } }

/// Defaults for every invocation, command line flags take precedence
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="timeout_secs_default")]
    pub timeout_secs: f64,
    #[serde(default="tcp_port_default")]
    pub tcp_port: u16,
    #[serde(default="baudrate_default")]
    pub baudrate: u32,
    #[serde(default="unit_id_default")]
    pub unit_id: u8,
    #[serde(default="gateway_framing_default")]
    pub gateway_framing: String,
    /// Pause between closing the port and reopening it at the new speed
    #[serde(default="reconnect_delay_ms_default")]
    pub reconnect_delay_ms: u64,
    #[serde(default="voltage_default")]
    pub voltage: VoltageConfig,
}

impl Default for Config {
    fn default() -> Self {
        return Config {
            timeout_secs: timeout_secs_default(),
            tcp_port: tcp_port_default(),
            baudrate: baudrate_default(),
            unit_id: unit_id_default(),
            gateway_framing: gateway_framing_default(),
            reconnect_delay_ms: reconnect_delay_ms_default(),
            voltage: voltage_default(),
        };
    }
}

impl Config {
    /// Loads `explicit` if given, otherwise the first of [`CONFIG_PATHS`] that
    /// exists. Without any file the built-in defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        if let Some(path) = explicit {
            return Config::from_file(path);
        }

        for candidate in CONFIG_PATHS {
            let path = Path::new(candidate);
            if path.is_file() {
                return Config::from_file(path);
            }
        }

        debug!("No config file found, using defaults");
        Ok(Config::default())
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
        let config = Config::parse(&contents).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Config, serde_yml::Error> {
        /* An empty file is a valid config with all defaults */
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yml::from_str(contents)
    }

    pub fn session(&self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            timeout: timeout_from_secs(self.timeout_secs)?,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            voltage_nominals: self.voltage.nominals.clone(),
            voltage_tolerance: self.voltage.tolerance,
        })
    }
}

/// What a running session needs, handed over on construction
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub timeout: Duration,
    pub reconnect_delay: Duration,
    pub voltage_nominals: Vec<f64>,
    pub voltage_tolerance: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        return SessionConfig {
            timeout: Duration::from_secs_f64(timeout_secs_default()),
            reconnect_delay: Duration::from_millis(reconnect_delay_ms_default()),
            voltage_nominals: voltage_nominals_default(),
            voltage_tolerance: voltage_tolerance_default(),
        };
    }
}

impl SessionConfig {
    /// Within tolerance of any nominal grid voltage
    pub fn voltage_plausible(&self, volts: f64) -> bool {
        self.voltage_nominals
            .iter()
            .any(|nominal| (volts - nominal).abs() <= nominal * self.voltage_tolerance)
    }
}
