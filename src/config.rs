use anyhow::{Context, Result};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::distance::CalibrationParams;
use crate::presence::PolicyThresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub calibration: CalibrationParams,
    pub policy: PolicyThresholds,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bluetooth address of the wearable, e.g. "C8:0F:10:2A:3B:4C"
    pub address: String,
    /// How long to look for the device before giving up at startup
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_probe_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub command: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            command: vec!["bluetoothctl".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub lock_command: Vec<String>,
    pub unlock_command: Vec<String>,
    /// The notification text is appended as the last argument
    pub notify_command: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            lock_command: vec![
                "cinnamon-screensaver-command".to_string(),
                "--lock".to_string(),
            ],
            unlock_command: vec![
                "cinnamon-screensaver-command".to_string(),
                "--deactivate".to_string(),
            ],
            notify_command: vec!["notify-send".to_string()],
        }
    }
}

/// Flat upper-case layout used by older config.json files
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    #[serde(rename = "TARGET_MAC_ADDRESS")]
    target_mac_address: String,
    #[serde(rename = "RSSI_AT_1M")]
    rssi_at_1m: f64,
    #[serde(rename = "PATH_LOSS_EXPONENT")]
    path_loss_exponent: f64,
    #[serde(rename = "DISTANCE_THRESHOLD_CM")]
    distance_threshold_cm: f64,
    #[serde(rename = "NEARBY_DISTANCE_CM")]
    nearby_distance_cm: f64,
    #[serde(rename = "TIME_THRESHOLD_SECONDS")]
    time_threshold_seconds: f64,
}

impl From<LegacyConfig> for Config {
    fn from(legacy: LegacyConfig) -> Self {
        Config {
            device: DeviceConfig {
                address: legacy.target_mac_address,
                probe_timeout_secs: default_probe_timeout_secs(),
            },
            calibration: CalibrationParams {
                rssi_at_1m: legacy.rssi_at_1m,
                path_loss_exponent: legacy.path_loss_exponent,
            },
            policy: PolicyThresholds {
                nearby_distance_cm: legacy.nearby_distance_cm,
                away_distance_cm: legacy.distance_threshold_cm,
                away_duration_secs: legacy.time_threshold_seconds,
            },
            scanner: ScannerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid device address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("path_loss_exponent must be greater than zero, got {0}")]
    InvalidPathLossExponent(f64),
    #[error("nearby_distance_cm ({nearby}) must not exceed away_distance_cm ({away})")]
    InvertedThresholds { nearby: f64, away: f64 },
    #[error("probe_timeout_secs must be greater than zero")]
    ZeroProbeTimeout,
    #[error("{0} must not be empty")]
    EmptyCommand(&'static str),
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_json(&content)
    }

    /// Parse either the structured layout or the legacy flat layout
    pub fn from_json(content: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(content).with_context(|| "Failed to parse config file")?;

        let config = if value.get("TARGET_MAC_ADDRESS").is_some() {
            let legacy: LegacyConfig = serde_json::from_value(value)
                .with_context(|| "Failed to parse legacy config file")?;
            Config::from(legacy)
        } else {
            serde_json::from_value(value).with_context(|| "Failed to parse config file")?
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_address()?;

        let finite = [
            ("rssi_at_1m", self.calibration.rssi_at_1m),
            ("path_loss_exponent", self.calibration.path_loss_exponent),
            ("nearby_distance_cm", self.policy.nearby_distance_cm),
            ("away_distance_cm", self.policy.away_distance_cm),
            ("away_duration_secs", self.policy.away_duration_secs),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { field, value });
            }
        }

        if self.calibration.path_loss_exponent <= 0.0 {
            return Err(ConfigError::InvalidPathLossExponent(
                self.calibration.path_loss_exponent,
            ));
        }

        let non_negative = [
            ("nearby_distance_cm", self.policy.nearby_distance_cm),
            ("away_distance_cm", self.policy.away_distance_cm),
            ("away_duration_secs", self.policy.away_duration_secs),
        ];
        for (field, value) in non_negative {
            if value < 0.0 {
                return Err(ConfigError::Negative { field, value });
            }
        }

        if self.policy.nearby_distance_cm > self.policy.away_distance_cm {
            return Err(ConfigError::InvertedThresholds {
                nearby: self.policy.nearby_distance_cm,
                away: self.policy.away_distance_cm,
            });
        }

        if self.device.probe_timeout_secs == 0 {
            return Err(ConfigError::ZeroProbeTimeout);
        }

        let commands = [
            ("scanner.command", &self.scanner.command),
            ("session.lock_command", &self.session.lock_command),
            ("session.unlock_command", &self.session.unlock_command),
            ("session.notify_command", &self.session.notify_command),
        ];
        for (field, argv) in commands {
            if argv.is_empty() {
                return Err(ConfigError::EmptyCommand(field));
            }
        }

        Ok(())
    }

    pub fn device_address(&self) -> Result<MacAddr6, ConfigError> {
        self.device
            .address
            .parse()
            .map_err(|e: macaddr::ParseError| ConfigError::InvalidAddress {
                address: self.device.address.clone(),
                reason: e.to_string(),
            })
    }

    pub fn default_config() -> Self {
        Config {
            device: DeviceConfig {
                address: "00:00:00:00:00:00".to_string(),
                probe_timeout_secs: default_probe_timeout_secs(),
            },
            calibration: CalibrationParams {
                rssi_at_1m: -60.0,
                path_loss_exponent: 2.0,
            },
            policy: PolicyThresholds {
                nearby_distance_cm: 100.0,
                away_distance_cm: 300.0,
                away_duration_secs: 5.0,
            },
            scanner: ScannerConfig::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
