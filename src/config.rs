//! Runtime configuration for the `tank` binary.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `TANK_*`
//! environment variables, command-line flags. The binary applies the last
//! layer; everything below it lives here.

use crate::heartbeat::DEFAULT_HEARTBEAT_PERIOD;
use crate::identity::DEFAULT_MACHINE_ID_PATH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
pub const DEFAULT_MOTOR_PROGRAM: &str = "/root/DMCC_Library/setMotor";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    #[default]
    Log,
    Command,
}

impl std::str::FromStr for ActuatorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(ActuatorKind::Log),
            "command" => Ok(ActuatorKind::Command),
            other => Err(ConfigError::Invalid {
                field: "actuator",
                reason: format!("unknown kind {:?}, expected log or command", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TankConfig {
    /// `host:port` of the `tank-broker` relay.
    pub broker_addr: String,
    /// Skips the machine-id file when set.
    pub tank_id: Option<String>,
    pub machine_id_path: PathBuf,
    pub heartbeat_period_ms: u64,
    /// Single topic level: a controller id, or `+` for any controller.
    pub controller_filter: String,
    pub actuator: ActuatorKind,
    pub motor_program: PathBuf,
    pub log_level: String,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            broker_addr: DEFAULT_BROKER_ADDR.to_string(),
            tank_id: None,
            machine_id_path: PathBuf::from(DEFAULT_MACHINE_ID_PATH),
            heartbeat_period_ms: DEFAULT_HEARTBEAT_PERIOD.as_millis() as u64,
            controller_filter: "+".to_string(),
            actuator: ActuatorKind::Log,
            motor_program: PathBuf::from(DEFAULT_MOTOR_PROGRAM),
            log_level: "info".to_string(),
        }
    }
}

impl TankConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: TankConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TANK_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// injectable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TANK_BROKER_ADDR") {
            self.broker_addr = v;
        }
        if let Some(v) = lookup("TANK_ID") {
            self.tank_id = Some(v);
        }
        if let Some(v) = lookup("TANK_MACHINE_ID_PATH") {
            self.machine_id_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TANK_HEARTBEAT_MS") {
            self.heartbeat_period_ms = v.parse().map_err(|_| ConfigError::Invalid {
                field: "heartbeat_period_ms",
                reason: format!("{:?} is not a number", v),
            })?;
        }
        if let Some(v) = lookup("TANK_CONTROLLER_FILTER") {
            self.controller_filter = v;
        }
        if let Some(v) = lookup("TANK_ACTUATOR") {
            self.actuator = v.parse()?;
        }
        if let Some(v) = lookup("TANK_MOTOR_PROGRAM") {
            self.motor_program = PathBuf::from(v);
        }
        if let Some(v) = lookup("TANK_LOG") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_period_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.controller_filter.is_empty() || self.controller_filter.contains(['/', '#']) {
            return Err(ConfigError::Invalid {
                field: "controller_filter",
                reason: format!("{:?} is not a single topic level", self.controller_filter),
            });
        }
        if self.broker_addr.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "broker_addr",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }
}
