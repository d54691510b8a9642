//! Battery notification decoding.

use chrono::{DateTime, Utc};

use crate::config::BatteryThresholds;
use crate::error::{Error, Result};

/// Length of a battery notification payload.
pub const BATTERY_PAYLOAD_LEN: usize = 2;

/// Command written to the module driver characteristic to request a
/// battery report.
pub const BATTERY_REQUEST_COMMAND: [u8; 2] = [0xAD, 0x02];

/// Decode a battery notification into volts.
///
/// Byte 0 is the whole volt part and byte 1 the decivolt part, so
/// `[3, 7]` decodes to 3.7 V.
///
/// ```
/// use logitow_ble::protocol::decode_battery_voltage;
///
/// let volts = decode_battery_voltage(&[3, 7]).unwrap();
/// assert!((volts - 3.7).abs() < 1e-6);
/// ```
pub fn decode_battery_voltage(payload: &[u8]) -> Result<f32> {
    match payload {
        [volts, decivolts] => Ok(f32::from(*volts) + f32::from(*decivolts) / 10.0),
        _ => Err(Error::InvalidPayload {
            channel: "battery",
            expected: BATTERY_PAYLOAD_LEN,
            actual: payload.len(),
        }),
    }
}

/// A decoded battery report.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryReading {
    /// Battery voltage.
    pub voltage: f32,
    /// When the report was received.
    pub received_at: DateTime<Utc>,
}

impl BatteryReading {
    /// Create a reading stamped with the current time.
    pub fn new(voltage: f32) -> Self {
        Self {
            voltage,
            received_at: Utc::now(),
        }
    }

    /// Decode a notification payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        decode_battery_voltage(payload).map(Self::new)
    }

    /// Charge as a fraction of the maximum voltage, clamped to `0.0..=1.0`.
    pub fn charge_ratio(&self, thresholds: &BatteryThresholds) -> f32 {
        if thresholds.max_voltage <= 0.0 {
            return 0.0;
        }
        (self.voltage / thresholds.max_voltage).clamp(0.0, 1.0)
    }

    /// Whether the battery is at or below the low-charge ratio.
    pub fn is_low_charge(&self, thresholds: &BatteryThresholds) -> bool {
        self.charge_ratio(thresholds) <= thresholds.low_charge_ratio
    }
}
