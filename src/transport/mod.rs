//! Radio transport abstraction.
//!
//! The session and registry logic never touch a BLE stack directly. Every
//! radio operation goes through [`Transport`], so the core can run against
//! [`btleplug`](self::btleplug::BtleplugTransport) in production and an
//! in-memory fake in tests.

pub mod btleplug;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::advertising::{Advertisement, AdvertisementDelta, DeviceId};
use crate::error::Result;

/// GATT communication status reported with connection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommunicationStatus {
    /// The operation completed.
    Success,
    /// The peripheral could not be reached.
    Unreachable,
    /// The peripheral answered with a protocol error.
    ProtocolError,
    /// The host is not allowed to perform the operation.
    AccessDenied,
}

impl fmt::Display for CommunicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Unreachable => write!(f, "Unreachable"),
            Self::ProtocolError => write!(f, "ProtocolError"),
            Self::AccessDenied => write!(f, "AccessDenied"),
        }
    }
}

/// Radio power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerState {
    /// No adapter capable of the central role.
    Unsupported,
    /// Adapter present, radio off.
    Off,
    /// Radio on.
    On,
}

/// Link status change reported by the transport for an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The link is up.
    Connected,
    /// The link dropped.
    Disconnected,
}

/// Identifies one running advertisement watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherHandle(pub u64);

/// Identifies one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// What a watcher observed.
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEventKind {
    /// A peripheral was seen for the first time.
    Added(Advertisement),
    /// A known peripheral's advertisement changed.
    Updated(AdvertisementDelta),
    /// A peripheral is no longer visible.
    Removed(DeviceId),
    /// The initial enumeration of nearby peripherals finished.
    EnumerationCompleted,
    /// The watcher stopped on its own.
    Stopped,
}

/// A watcher event tagged with the watcher that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherEvent {
    /// Producing watcher.
    pub watcher: WatcherHandle,
    /// The observation.
    pub kind: WatcherEventKind,
}

impl WatcherEvent {
    /// Tag an observation with its watcher.
    pub fn new(watcher: WatcherHandle, kind: WatcherEventKind) -> Self {
        Self { watcher, kind }
    }
}

/// Callback invoked with each notification value.
pub type NotificationHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Callback invoked when a connection's link status changes.
pub type ConnectionStatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// The radio operations the session manager needs.
///
/// Handlers passed to the transport may be called from any thread and must
/// not be called while the transport holds internal locks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current radio power state.
    async fn power_state(&self) -> PowerState;

    /// Start an unfiltered advertisement watcher.
    ///
    /// Events are tagged with the returned handle and pushed onto `events`
    /// until the watcher is stopped.
    async fn start_watcher(
        &self,
        requested_properties: &[&str],
        events: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Result<WatcherHandle>;

    /// Stop a watcher. Stopping an unknown handle is not an error.
    async fn stop_watcher(&self, handle: WatcherHandle) -> Result<()>;

    /// Open a link to a peripheral.
    async fn connect(
        &self,
        id: &DeviceId,
        on_status: ConnectionStatusHandler,
    ) -> Result<ConnectionHandle>;

    /// List the GATT services of a connected peripheral.
    async fn enumerate_services(&self, conn: ConnectionHandle) -> Result<Vec<Uuid>>;

    /// List the characteristics of one service.
    async fn enumerate_characteristics(
        &self,
        conn: ConnectionHandle,
        service: Uuid,
    ) -> Result<Vec<Uuid>>;

    /// Enable notifications on a characteristic.
    async fn subscribe_notify(
        &self,
        conn: ConnectionHandle,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<()>;

    /// Write a value to a characteristic.
    async fn write_value(
        &self,
        conn: ConnectionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Close a link and release its handle.
    async fn disconnect(&self, conn: ConnectionHandle) -> Result<()>;

    /// Whether the transport still reports the link as up.
    async fn is_connected(&self, conn: ConnectionHandle) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(CommunicationStatus::Success.to_string(), "Success");
        assert_eq!(CommunicationStatus::AccessDenied.to_string(), "AccessDenied");
    }

    #[test]
    fn test_handles_are_comparable() {
        assert_eq!(WatcherHandle(1), WatcherHandle(1));
        assert_ne!(ConnectionHandle(1), ConnectionHandle(2));
    }
}
