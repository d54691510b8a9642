//! Events delivered to the host.
//!
//! The core reports everything through the [`EventSink`] trait. Hosts that
//! prefer channels can use [`ChannelSink`], which republishes each call as a
//! [`ManagerEvent`] on a broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::ble::advertising::DeviceId;
use crate::protocol::BLOCK_PAYLOAD_LEN;
use crate::transport::CommunicationStatus;

/// Listener for scan and device lifecycle events.
///
/// Each method is called once per occurrence. Calls can arrive from any task,
/// so implementations must not block for long.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Discovery started.
    fn on_scan_started(&self);

    /// Discovery stopped.
    fn on_scan_stopped(&self);

    /// A new LOGITOW device was discovered.
    fn on_device_discovered(&self, id: &DeviceId);

    /// A discovered (not connected) device is no longer visible.
    fn on_device_lost(&self, id: &DeviceId);

    /// A device finished connecting and all channels are subscribed.
    fn on_device_connected(&self, id: &DeviceId);

    /// A device was disconnected.
    fn on_device_disconnected(&self, id: &DeviceId);

    /// A raw block-state payload arrived.
    fn on_block_data_received(&self, id: &DeviceId, data: [u8; BLOCK_PAYLOAD_LEN]);

    /// A battery voltage report arrived.
    fn on_battery_info_received(&self, id: &DeviceId, volts: f32);

    /// A transport operation for this device failed.
    fn on_connection_error(&self, id: &DeviceId, status: CommunicationStatus);

    /// A battery report is at or below the low-charge threshold.
    fn on_battery_low(&self, _id: &DeviceId, _volts: f32) {}
}

/// Owned form of every [`EventSink`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// See [`EventSink::on_scan_started`].
    ScanStarted,
    /// See [`EventSink::on_scan_stopped`].
    ScanStopped,
    /// See [`EventSink::on_device_discovered`].
    DeviceDiscovered(DeviceId),
    /// See [`EventSink::on_device_lost`].
    DeviceLost(DeviceId),
    /// See [`EventSink::on_device_connected`].
    DeviceConnected(DeviceId),
    /// See [`EventSink::on_device_disconnected`].
    DeviceDisconnected(DeviceId),
    /// See [`EventSink::on_block_data_received`].
    BlockData {
        /// Device the payload came from.
        id: DeviceId,
        /// Raw payload.
        data: [u8; BLOCK_PAYLOAD_LEN],
    },
    /// See [`EventSink::on_battery_info_received`].
    BatteryInfo {
        /// Device the report came from.
        id: DeviceId,
        /// Battery voltage.
        volts: f32,
    },
    /// See [`EventSink::on_battery_low`].
    BatteryLow {
        /// Device the report came from.
        id: DeviceId,
        /// Battery voltage.
        volts: f32,
    },
    /// See [`EventSink::on_connection_error`].
    ConnectionError {
        /// Device the error belongs to.
        id: DeviceId,
        /// Reported status.
        status: CommunicationStatus,
    },
}

impl ManagerEvent {
    /// The device this event concerns, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::ScanStarted | Self::ScanStopped => None,
            Self::DeviceDiscovered(id)
            | Self::DeviceLost(id)
            | Self::DeviceConnected(id)
            | Self::DeviceDisconnected(id) => Some(id),
            Self::BlockData { id, .. }
            | Self::BatteryInfo { id, .. }
            | Self::BatteryLow { id, .. }
            | Self::ConnectionError { id, .. } => Some(id),
        }
    }

    /// Replay this event onto a sink.
    pub fn dispatch(&self, sink: &dyn EventSink) {
        match self {
            Self::ScanStarted => sink.on_scan_started(),
            Self::ScanStopped => sink.on_scan_stopped(),
            Self::DeviceDiscovered(id) => sink.on_device_discovered(id),
            Self::DeviceLost(id) => sink.on_device_lost(id),
            Self::DeviceConnected(id) => sink.on_device_connected(id),
            Self::DeviceDisconnected(id) => sink.on_device_disconnected(id),
            Self::BlockData { id, data } => sink.on_block_data_received(id, *data),
            Self::BatteryInfo { id, volts } => sink.on_battery_info_received(id, *volts),
            Self::BatteryLow { id, volts } => sink.on_battery_low(id, *volts),
            Self::ConnectionError { id, status } => sink.on_connection_error(id, *status),
        }
    }
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// An [`EventSink`] that broadcasts every call as a [`ManagerEvent`].
pub struct ChannelSink {
    tx: broadcast::Sender<ManagerEvent>,
    callback_counter: AtomicU64,
}

impl ChannelSink {
    /// Create a sink whose channel buffers `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }

    /// Register a callback invoked for every event.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ManagerEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event callback lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    fn publish(&self, event: ManagerEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for ChannelSink {
    fn on_scan_started(&self) {
        self.publish(ManagerEvent::ScanStarted);
    }

    fn on_scan_stopped(&self) {
        self.publish(ManagerEvent::ScanStopped);
    }

    fn on_device_discovered(&self, id: &DeviceId) {
        self.publish(ManagerEvent::DeviceDiscovered(id.clone()));
    }

    fn on_device_lost(&self, id: &DeviceId) {
        self.publish(ManagerEvent::DeviceLost(id.clone()));
    }

    fn on_device_connected(&self, id: &DeviceId) {
        self.publish(ManagerEvent::DeviceConnected(id.clone()));
    }

    fn on_device_disconnected(&self, id: &DeviceId) {
        self.publish(ManagerEvent::DeviceDisconnected(id.clone()));
    }

    fn on_block_data_received(&self, id: &DeviceId, data: [u8; BLOCK_PAYLOAD_LEN]) {
        self.publish(ManagerEvent::BlockData {
            id: id.clone(),
            data,
        });
    }

    fn on_battery_info_received(&self, id: &DeviceId, volts: f32) {
        self.publish(ManagerEvent::BatteryInfo {
            id: id.clone(),
            volts,
        });
    }

    fn on_connection_error(&self, id: &DeviceId, status: CommunicationStatus) {
        self.publish(ManagerEvent::ConnectionError {
            id: id.clone(),
            status,
        });
    }

    fn on_battery_low(&self, id: &DeviceId, volts: f32) {
        self.publish(ManagerEvent::BatteryLow {
            id: id.clone(),
            volts,
        });
    }
}

/// Test sink that records every event in order.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: parking_lot::Mutex<Vec<ManagerEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<ManagerEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&ManagerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: ManagerEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn on_scan_started(&self) {
        self.push(ManagerEvent::ScanStarted);
    }
    fn on_scan_stopped(&self) {
        self.push(ManagerEvent::ScanStopped);
    }
    fn on_device_discovered(&self, id: &DeviceId) {
        self.push(ManagerEvent::DeviceDiscovered(id.clone()));
    }
    fn on_device_lost(&self, id: &DeviceId) {
        self.push(ManagerEvent::DeviceLost(id.clone()));
    }
    fn on_device_connected(&self, id: &DeviceId) {
        self.push(ManagerEvent::DeviceConnected(id.clone()));
    }
    fn on_device_disconnected(&self, id: &DeviceId) {
        self.push(ManagerEvent::DeviceDisconnected(id.clone()));
    }
    fn on_block_data_received(&self, id: &DeviceId, data: [u8; BLOCK_PAYLOAD_LEN]) {
        self.push(ManagerEvent::BlockData {
            id: id.clone(),
            data,
        });
    }
    fn on_battery_info_received(&self, id: &DeviceId, volts: f32) {
        self.push(ManagerEvent::BatteryInfo {
            id: id.clone(),
            volts,
        });
    }
    fn on_connection_error(&self, id: &DeviceId, status: CommunicationStatus) {
        self.push(ManagerEvent::ConnectionError {
            id: id.clone(),
            status,
        });
    }
    fn on_battery_low(&self, id: &DeviceId, volts: f32) {
        self.push(ManagerEvent::BatteryLow {
            id: id.clone(),
            volts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_dispatch_reaches_sink() {
        let mut sink = MockEventSink::new();
        sink.expect_on_device_discovered()
            .withf(|id| id.as_str() == "dev-1")
            .times(1)
            .return_const(());
        sink.expect_on_connection_error()
            .with(
                mockall::predicate::always(),
                eq(CommunicationStatus::Unreachable),
            )
            .times(1)
            .return_const(());

        ManagerEvent::DeviceDiscovered("dev-1".into()).dispatch(&sink);
        ManagerEvent::ConnectionError {
            id: "dev-1".into(),
            status: CommunicationStatus::Unreachable,
        }
        .dispatch(&sink);
    }

    #[test]
    fn test_device_id_accessor() {
        assert_eq!(ManagerEvent::ScanStarted.device_id(), None);
        let event = ManagerEvent::BatteryInfo {
            id: "dev-2".into(),
            volts: 2.0,
        };
        assert_eq!(event.device_id().map(DeviceId::as_str), Some("dev-2"));
    }

    #[tokio::test]
    async fn test_channel_sink_broadcasts() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();

        sink.on_scan_started();
        sink.on_block_data_received(&"dev-1".into(), [1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(rx.recv().await.unwrap(), ManagerEvent::ScanStarted);
        assert_eq!(
            rx.recv().await.unwrap(),
            ManagerEvent::BlockData {
                id: "dev-1".into(),
                data: [1, 2, 3, 4, 5, 6, 7],
            }
        );
    }

    #[tokio::test]
    async fn test_channel_sink_callback_and_unregister() {
        let sink = ChannelSink::new(8);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let handle = sink.on_event(move |event| seen_clone.lock().push(event));
        tokio::task::yield_now().await;

        sink.on_device_lost(&"dev-9".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            seen.lock().as_slice(),
            &[ManagerEvent::DeviceLost("dev-9".into())]
        );

        handle.unregister();
        tokio::time::sleep(Duration::from_millis(5)).await;
        sink.on_scan_stopped();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }
}
