//! Driver configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Log every ZigBee data frame with a field breakdown at debug level
    #[serde(default)]
    pub mesh_trace: bool,
}

/// Serial link settings; changing `port` or `baud` reopens the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial device, e.g. `/dev/ttyUSB0` or `COM3`
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Write D6, D7 and AO after the radio is probed
    #[serde(default = "default_true")]
    pub initialize_radio: bool,
    /// RTS/CTS hardware flow control
    #[serde(default = "default_true")]
    pub rtscts: bool,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            ..Self::default()
        }
    }

    /// An empty port name or zero baud rate cannot be opened
    pub fn is_valid(&self) -> bool {
        !self.port.is_empty() && self.baud != 0
    }

    /// Whether moving from `self` to `other` requires reopening the port
    pub fn requires_reopen(&self, other: &SerialSettings) -> bool {
        self.port != other.port || self.baud != other.baud
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: default_baud(),
            initialize_radio: true,
            rtscts: true,
        }
    }
}

fn default_baud() -> u32 {
    115200
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay between port open attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// How long a blocking mesh discovery collects neighbor tables
    #[serde(default = "default_discovery_window")]
    pub discovery_window_ms: u64,
    /// Lifetime of one Mgmt-LQI request
    #[serde(default = "default_lqi_timeout")]
    pub lqi_timeout_secs: u64,
    /// Period of the conversation timeout sweep
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl TimingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn lqi_timeout(&self) -> Duration {
        Duration::from_secs(self.lqi_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay(),
            discovery_window_ms: default_discovery_window(),
            lqi_timeout_secs: default_lqi_timeout(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

fn default_retry_delay() -> u64 {
    500
}

fn default_discovery_window() -> u64 {
    3000
}

fn default_lqi_timeout() -> u64 {
    40
}

fn default_tick_interval() -> u64 {
    250
}
