//! [`Transport`] implementation on top of `btleplug`.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    ConnectionHandle, ConnectionStatus, ConnectionStatusHandler, NotificationHandler, PowerState,
    Transport, WatcherEvent, WatcherEventKind, WatcherHandle,
};
use crate::ble::advertising::{
    Advertisement, AdvertisementDelta, DeviceId, PropertyValue, PROPERTY_DEVICE_ADDRESS,
    PROPERTY_IS_CONNECTED, PROPERTY_RSSI,
};
use crate::error::{Error, Result};

/// An open link and the notification routing for it.
struct Link {
    id: DeviceId,
    peripheral: Peripheral,
    on_status: ConnectionStatusHandler,
    handlers: Arc<RwLock<HashMap<Uuid, NotificationHandler>>>,
    pump: JoinHandle<()>,
}

/// BLE transport backed by the first adapter `btleplug` reports.
///
/// `btleplug` does not surface the connectable flag of an advertisement, so
/// every advertisement is reported as connectable. It also never reports a
/// peripheral as gone, so watchers produce no `Removed` events.
pub struct BtleplugTransport {
    adapter: Adapter,
    power: Arc<RwLock<PowerState>>,
    peripherals: Arc<RwLock<HashMap<DeviceId, Peripheral>>>,
    watchers: RwLock<HashMap<WatcherHandle, JoinHandle<()>>>,
    links: Arc<RwLock<HashMap<ConnectionHandle, Link>>>,
    next_handle: AtomicU64,
    monitor: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let power = Arc::new(RwLock::new(PowerState::On));
        let links: Arc<RwLock<HashMap<ConnectionHandle, Link>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let mut events = adapter.events().await?;
        let monitor = {
            let power = power.clone();
            let links = links.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        CentralEvent::StateUpdate(state) => {
                            let new_state = power_from_central(state);
                            debug!("Adapter state changed: {:?}", new_state);
                            *power.write() = new_state;
                        }
                        CentralEvent::DeviceDisconnected(id) => {
                            Self::report_link_loss(&links, &id);
                        }
                        _ => {}
                    }
                }
                debug!("Adapter event monitor ended");
            })
        };

        Ok(Self {
            adapter,
            power,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            watchers: RwLock::new(HashMap::new()),
            links,
            next_handle: AtomicU64::new(1),
            monitor,
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn report_link_loss(links: &RwLock<HashMap<ConnectionHandle, Link>>, id: &PeripheralId) {
        let id = DeviceId::new(id.to_string());
        let handlers: Vec<ConnectionStatusHandler> = links
            .read()
            .values()
            .filter(|link| link.id == id)
            .map(|link| link.on_status.clone())
            .collect();

        if !handlers.is_empty() {
            debug!("Link lost to {}", id);
        }
        for handler in handlers {
            handler(ConnectionStatus::Disconnected);
        }
    }

    fn peripheral_for(&self, conn: ConnectionHandle) -> Result<Peripheral> {
        self.links
            .read()
            .get(&conn)
            .map(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn characteristic_for(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Build an advertisement from a peripheral's cached properties.
    async fn advertisement_for(peripheral: &Peripheral) -> Option<Advertisement> {
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let mut advertisement = Advertisement::new(peripheral.id().to_string())
            .with_connectable(true)
            .with_property(
                PROPERTY_DEVICE_ADDRESS,
                PropertyValue::Text(properties.address.to_string()),
            )
            .with_property(
                PROPERTY_IS_CONNECTED,
                PropertyValue::Bool(peripheral.is_connected().await.unwrap_or(false)),
            );
        advertisement.name = properties.local_name;
        if let Some(rssi) = properties.rssi {
            advertisement =
                advertisement.with_property(PROPERTY_RSSI, PropertyValue::Int(rssi.into()));
        }
        Some(advertisement)
    }

    /// Translate one central event for a watcher.
    ///
    /// The first sighting of a peripheral by this watcher becomes `Added`,
    /// any later one `Updated`.
    async fn handle_event(
        adapter: &Adapter,
        event: CentralEvent,
        peripherals: &RwLock<HashMap<DeviceId, Peripheral>>,
        reported: &mut HashSet<DeviceId>,
    ) -> Option<WatcherEventKind> {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                return Some(WatcherEventKind::Stopped)
            }
            _ => return None,
        };

        trace!("Device seen: {:?}", id);
        let peripheral = adapter.peripheral(&id).await.ok()?;
        let advertisement = Self::advertisement_for(&peripheral).await?;
        peripherals
            .write()
            .insert(advertisement.id.clone(), peripheral);

        if reported.insert(advertisement.id.clone()) {
            return Some(WatcherEventKind::Added(advertisement));
        }
        let mut delta = AdvertisementDelta::new(advertisement.id);
        delta.name = advertisement.name;
        delta.properties = advertisement.properties;
        Some(WatcherEventKind::Updated(delta))
    }
}

fn power_from_central(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::On,
        CentralState::PoweredOff => PowerState::Off,
        _ => PowerState::Unsupported,
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn power_state(&self) -> PowerState {
        *self.power.read()
    }

    async fn start_watcher(
        &self,
        requested_properties: &[&str],
        events: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Result<WatcherHandle> {
        debug!("Starting watcher, requested properties: {:?}", requested_properties);

        let mut central_events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let handle = WatcherHandle(self.allocate());
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let task = tokio::spawn(async move {
            let send = |kind| events.send(WatcherEvent::new(handle, kind)).is_ok();
            let mut reported = HashSet::new();

            // Peripherals the adapter already knows about form the initial enumeration.
            match adapter.peripherals().await {
                Ok(known) => {
                    for peripheral in known {
                        if let Some(advertisement) = Self::advertisement_for(&peripheral).await {
                            peripherals
                                .write()
                                .insert(advertisement.id.clone(), peripheral);
                            reported.insert(advertisement.id.clone());
                            if !send(WatcherEventKind::Added(advertisement)) {
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to list known peripherals: {}", e),
            }
            if !send(WatcherEventKind::EnumerationCompleted) {
                return;
            }

            while let Some(event) = central_events.next().await {
                let kind =
                    Self::handle_event(&adapter, event, &peripherals, &mut reported).await;
                let Some(kind) = kind else {
                    continue;
                };
                let stopped = kind == WatcherEventKind::Stopped;
                if !send(kind) || stopped {
                    debug!("Watcher {:?} ended", handle);
                    return;
                }
            }

            error!("Adapter event stream closed");
            send(WatcherEventKind::Stopped);
        });

        self.watchers.write().insert(handle, task);
        Ok(handle)
    }

    async fn stop_watcher(&self, handle: WatcherHandle) -> Result<()> {
        let (task, remaining) = {
            let mut watchers = self.watchers.write();
            let task = watchers.remove(&handle);
            (task, watchers.len())
        };

        let Some(task) = task else {
            return Ok(());
        };
        task.abort();

        if remaining == 0 {
            self.adapter.stop_scan().await?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        id: &DeviceId,
        on_status: ConnectionStatusHandler,
    ) -> Result<ConnectionHandle> {
        let peripheral = self
            .peripherals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }

        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e.into());
            }
        };

        let handlers: Arc<RwLock<HashMap<Uuid, NotificationHandler>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let pump = {
            let handlers = handlers.clone();
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    let handler = handlers.read().get(&notification.uuid).cloned();
                    match handler {
                        Some(handler) => handler(Bytes::from(notification.value)),
                        None => trace!(
                            "Unrouted notification from {} on {}",
                            id,
                            notification.uuid
                        ),
                    }
                }
                debug!("Notification stream for {} ended", id);
            })
        };

        let handle = ConnectionHandle(self.allocate());
        self.links.write().insert(
            handle,
            Link {
                id: id.clone(),
                peripheral,
                on_status: on_status.clone(),
                handlers,
                pump,
            },
        );

        on_status(ConnectionStatus::Connected);
        Ok(handle)
    }

    async fn enumerate_services(&self, conn: ConnectionHandle) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral_for(conn)?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().iter().map(|s| s.uuid).collect())
    }

    async fn enumerate_characteristics(
        &self,
        conn: ConnectionHandle,
        service: Uuid,
    ) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral_for(conn)?;
        peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })
    }

    async fn subscribe_notify(
        &self,
        conn: ConnectionHandle,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<()> {
        let (peripheral, handlers) = {
            let links = self.links.read();
            let link = links.get(&conn).ok_or(Error::NotConnected)?;
            (link.peripheral.clone(), link.handlers.clone())
        };
        let target = Self::characteristic_for(&peripheral, characteristic)?;

        handlers.write().insert(characteristic, on_value);
        if let Err(e) = peripheral.subscribe(&target).await {
            handlers.write().remove(&characteristic);
            return Err(e.into());
        }

        debug!("Subscribed to notifications from {}", characteristic);
        Ok(())
    }

    async fn write_value(
        &self,
        conn: ConnectionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral_for(conn)?;
        let target = Self::characteristic_for(&peripheral, characteristic)?;

        peripheral
            .write(&target, value, WriteType::WithResponse)
            .await?;

        trace!("Wrote {} bytes to characteristic {}", value.len(), characteristic);
        Ok(())
    }

    async fn disconnect(&self, conn: ConnectionHandle) -> Result<()> {
        let link = self.links.write().remove(&conn);
        let Some(link) = link else {
            return Ok(());
        };
        link.pump.abort();

        if link.peripheral.is_connected().await.unwrap_or(false) {
            link.peripheral.disconnect().await?;
        }
        debug!("Released link to {}", link.id);
        Ok(())
    }

    async fn is_connected(&self, conn: ConnectionHandle) -> bool {
        match self.peripheral_for(conn) {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.monitor.abort();
        for (_, task) in self.watchers.write().drain() {
            task.abort();
        }
        for (_, link) in self.links.write().drain() {
            link.pump.abort();
        }
    }
}
