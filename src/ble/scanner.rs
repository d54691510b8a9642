//! BLE scanning functionality.
//!
//! Owns the advertisement watcher and pumps its events into the registry.

use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::REQUESTED_PROPERTIES;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::registry::DeviceRegistry;
use crate::transport::{PowerState, Transport, WatcherEvent, WatcherEventKind, WatcherHandle};

struct ActiveWatcher {
    handle: WatcherHandle,
    pump: JoinHandle<()>,
}

type WatcherSlot = Mutex<Option<ActiveWatcher>>;

/// Starts and stops discovery.
///
/// At most one watcher is active. Events from any other watcher are ignored.
pub struct ScanController {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn EventSink>,
    active: Arc<WatcherSlot>,
}

impl ScanController {
    /// Create a controller feeding `registry`.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            registry,
            sink,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start discovery.
    ///
    /// Resets the registry first, so every nearby device is reported again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] or [`Error::BluetoothDisabled`]
    /// if the radio cannot scan, or the transport error if the watcher fails
    /// to start.
    pub async fn start(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        match self.transport.power_state().await {
            PowerState::Unsupported => return Err(Error::BluetoothUnavailable),
            PowerState::Off => return Err(Error::BluetoothDisabled),
            PowerState::On => {}
        }

        info!("Starting BLE scan for LOGITOW devices");
        self.registry.reset();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.transport.start_watcher(REQUESTED_PROPERTIES, tx).await?;

        self.sink.on_scan_started();

        let pump = tokio::spawn(pump_events(
            handle,
            rx,
            self.transport.clone(),
            self.registry.clone(),
            self.sink.clone(),
            Arc::downgrade(&self.active),
        ));
        *active = Some(ActiveWatcher { handle, pump });

        Ok(())
    }

    /// Stop discovery.
    pub async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(watcher) = active.take() else {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        };

        info!("Stopping BLE scan");
        watcher.pump.abort();
        let result = self.transport.stop_watcher(watcher.handle).await;
        drop(active);

        self.sink.on_scan_stopped();
        result
    }

    /// Stop, then start again.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Check if currently scanning.
    pub async fn is_scanning(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(watcher) = active.take() {
                watcher.pump.abort();
            }
        }
    }
}

async fn pump_events(
    handle: WatcherHandle,
    mut rx: mpsc::UnboundedReceiver<WatcherEvent>,
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn EventSink>,
    slot: Weak<WatcherSlot>,
) {
    while let Some(event) = rx.recv().await {
        if event.watcher != handle {
            trace!("Ignoring event from stale watcher {:?}", event.watcher);
            continue;
        }

        match event.kind {
            WatcherEventKind::Added(advertisement) => registry.on_advertisement_seen(advertisement),
            WatcherEventKind::Updated(delta) => registry.on_advertisement_updated(delta),
            WatcherEventKind::Removed(id) => registry.on_advertisement_lost(&id),
            WatcherEventKind::EnumerationCompleted => registry.on_enumeration_completed(),
            WatcherEventKind::Stopped => break,
        }
    }

    // The watcher ended on its own.
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let mut active = slot.lock().await;
    if active.as_ref().map(|w| w.handle) != Some(handle) {
        return;
    }
    active.take();
    if let Err(e) = transport.stop_watcher(handle).await {
        warn!("Failed to release watcher {:?}: {}", handle, e);
    }
    drop(active);

    info!("BLE scan stopped by the watcher");
    sink.on_scan_stopped();
}
