//! Manager configuration.
//!
//! All tunables have defaults matching the behaviour of the stock LOGITOW
//! bridge, so `ManagerConfig::default()` is the usual starting point.

use crate::ble::uuids::LOGITOW_DEVICE_NAME;
use crate::error::{Error, Result};

/// Default bound on simultaneously connected devices.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Default buffer size of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Voltage limits used to classify battery reports.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryThresholds {
    /// Voltage of an empty battery.
    pub min_voltage: f32,
    /// Voltage of a full battery.
    pub max_voltage: f32,
    /// Charge ratio at or below which the battery counts as low.
    pub low_charge_ratio: f32,
}

impl Default for BatteryThresholds {
    fn default() -> Self {
        Self {
            min_voltage: 1.5,
            max_voltage: 2.1,
            low_charge_ratio: 0.05,
        }
    }
}

/// Configuration for [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Advertised name a peripheral must carry to be tracked.
    pub target_name: String,
    /// Maximum number of connected sessions.
    pub max_connections: usize,
    /// Connect to every device as soon as it is discovered.
    pub auto_connect: bool,
    /// Restart discovery whenever a connected device drops.
    ///
    /// This wipes unknown and discovered entries for every device, not just
    /// the one that dropped.
    pub restart_scan_on_disconnect: bool,
    /// Buffer size of the [`ChannelSink`](crate::events::ChannelSink) broadcast.
    pub event_capacity: usize,
    /// Battery classification limits.
    pub battery: BatteryThresholds,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            target_name: LOGITOW_DEVICE_NAME.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            auto_connect: false,
            restart_scan_on_disconnect: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            battery: BatteryThresholds::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a different advertised name.
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = name.into();
        self
    }

    /// Set the connection bound.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enable or disable connecting on discovery.
    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Enable or disable the scan restart after a disconnect.
    pub fn with_restart_scan_on_disconnect(mut self, enabled: bool) -> Self {
        self.restart_scan_on_disconnect = enabled;
        self
    }

    /// Set the event broadcast buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the battery thresholds.
    pub fn with_battery_thresholds(mut self, thresholds: BatteryThresholds) -> Self {
        self.battery = thresholds;
        self
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.target_name.is_empty() {
            return Err(invalid("target_name", &self.target_name));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", self.max_connections));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", self.event_capacity));
        }
        let battery = &self.battery;
        if !(battery.max_voltage > battery.min_voltage && battery.min_voltage >= 0.0) {
            return Err(invalid(
                "battery.max_voltage",
                format!("{} (min {})", battery.max_voltage, battery.min_voltage),
            ));
        }
        if !(0.0..=1.0).contains(&battery.low_charge_ratio) {
            return Err(invalid("battery.low_charge_ratio", battery.low_charge_ratio));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
