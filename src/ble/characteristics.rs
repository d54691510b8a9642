//! Notification channel definitions.
//!
//! A channel is a (service, characteristic) pair dedicated to one data
//! stream.

use uuid::Uuid;

use crate::ble::uuids::*;

/// The logical data streams a LOGITOW brick exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelKind {
    /// Block attach/detach telemetry.
    Data,
    /// Battery voltage reports.
    Battery,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "block data"),
            Self::Battery => write!(f, "battery"),
        }
    }
}

/// Static description of one notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Which stream this channel carries.
    pub kind: ChannelKind,
    /// Service exposing the characteristic.
    pub service: Uuid,
    /// Characteristic to subscribe to.
    pub characteristic: Uuid,
    /// Whether a session can reach `Ready` without this channel.
    pub required: bool,
}

/// Block-state channel.
pub const DATA_CHANNEL: Channel = Channel {
    kind: ChannelKind::Data,
    service: DATA_SERVICE_UUID,
    characteristic: DATA_READ_CHARACTERISTIC_UUID,
    required: true,
};

/// Battery channel on the module driver service.
pub const BATTERY_CHANNEL: Channel = Channel {
    kind: ChannelKind::Battery,
    service: MODULE_DRIVER_SERVICE_UUID,
    characteristic: MODULE_DRIVER_CHARACTERISTIC_UUID,
    required: false,
};

/// All channels, in subscription order.
pub const CHANNELS: [Channel; 2] = [DATA_CHANNEL, BATTERY_CHANNEL];

/// Look up the channel served by a given service.
pub fn channel_for_service(service: &Uuid) -> Option<Channel> {
    CHANNELS.iter().copied().find(|c| c.service == *service)
}
