//! Error types for the logitow-ble crate.

use thiserror::Error;

use crate::transport::CommunicationStatus;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter with central role support is present.
    #[error("Bluetooth not available")]
    BluetoothUnavailable,

    /// The Bluetooth radio exists but is switched off.
    #[error("Bluetooth radio is powered off")]
    BluetoothDisabled,

    /// The specified device was not found in the registry.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// A connection sequence is already running for this device.
    #[error("Connection to {identifier} already in progress")]
    AlreadyConnecting {
        /// The device identifier.
        identifier: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The operation was superseded by a disconnect or a newer attempt.
    #[error("Operation cancelled")]
    Cancelled,

    /// A transport operation reported a non-success GATT status.
    #[error("{context} failed with status {status}")]
    Transport {
        /// The operation that failed.
        context: String,
        /// Status reported by the transport.
        status: CommunicationStatus,
    },

    /// A notification payload had the wrong length.
    #[error("Invalid {channel} payload: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        /// The channel the payload arrived on.
        channel: &'static str,
        /// Expected payload length.
        expected: usize,
        /// Actual payload length.
        actual: usize,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// The maximum number of connected devices has been reached.
    #[error("Maximum devices ({max}) already connected")]
    MaxConnectionsReached {
        /// The maximum number of connections allowed.
        max: usize,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::Transport`] for the given operation.
    pub fn transport(context: impl Into<String>, status: CommunicationStatus) -> Self {
        Self::Transport {
            context: context.into(),
            status,
        }
    }

    /// The GATT status reported to the event sink for this error.
    pub fn status(&self) -> CommunicationStatus {
        match self {
            Self::Transport { status, .. } => *status,
            Self::Bluetooth(e) => match e {
                btleplug::Error::PermissionDenied => CommunicationStatus::AccessDenied,
                btleplug::Error::DeviceNotFound
                | btleplug::Error::NotConnected
                | btleplug::Error::TimedOut(_) => CommunicationStatus::Unreachable,
                _ => CommunicationStatus::ProtocolError,
            },
            Self::BluetoothUnavailable
            | Self::BluetoothDisabled
            | Self::NotConnected
            | Self::ConnectionFailed { .. }
            | Self::DeviceNotFound { .. } => CommunicationStatus::Unreachable,
            _ => CommunicationStatus::ProtocolError,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
