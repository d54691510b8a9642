//! Scriptable in-memory transport for tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::{
    CommunicationStatus, ConnectionHandle, ConnectionStatus, ConnectionStatusHandler,
    NotificationHandler, PowerState, Transport, WatcherEvent, WatcherEventKind, WatcherHandle,
};
use crate::ble::advertising::DeviceId;
use crate::ble::uuids::*;
use crate::error::{Error, Result};

struct FakeLink {
    id: DeviceId,
    on_status: ConnectionStatusHandler,
    handlers: HashMap<Uuid, NotificationHandler>,
    alive: bool,
}

struct FakeState {
    power: PowerState,
    next_handle: u64,
    watchers: HashMap<WatcherHandle, mpsc::UnboundedSender<WatcherEvent>>,
    latest_watcher: Option<WatcherHandle>,
    stopped_watchers: Vec<WatcherHandle>,
    links: HashMap<ConnectionHandle, FakeLink>,
    services: Vec<(Uuid, Vec<Uuid>)>,
    fail_connect: Option<CommunicationStatus>,
    fail_services: Option<CommunicationStatus>,
    fail_subscribe: HashMap<Uuid, CommunicationStatus>,
    connect_calls: usize,
    writes: Vec<(DeviceId, Uuid, Vec<u8>)>,
    disconnects: Vec<DeviceId>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            power: PowerState::On,
            next_handle: 1,
            watchers: HashMap::new(),
            latest_watcher: None,
            stopped_watchers: Vec::new(),
            links: HashMap::new(),
            services: vec![
                (DATA_SERVICE_UUID, vec![DATA_READ_CHARACTERISTIC_UUID]),
                (MODULE_DRIVER_SERVICE_UUID, vec![MODULE_DRIVER_CHARACTERISTIC_UUID]),
            ],
            fail_connect: None,
            fail_services: None,
            fail_subscribe: HashMap::new(),
            connect_calls: 0,
            writes: Vec::new(),
            disconnects: Vec::new(),
        }
    }
}

/// In-memory [`Transport`] with failure injection.
///
/// Every peripheral exposes the LOGITOW data and module driver services
/// unless [`set_services`](Self::set_services) says otherwise.
#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
    subscribe_gate: Option<Arc<Semaphore>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose `subscribe_notify` calls each wait for one permit
    /// on the returned semaphore.
    pub(crate) fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Self {
            state: Mutex::new(FakeState::default()),
            subscribe_gate: Some(gate.clone()),
        };
        (Arc::new(transport), gate)
    }

    pub(crate) fn set_power(&self, power: PowerState) {
        self.state.lock().power = power;
    }

    pub(crate) fn set_services(&self, services: Vec<(Uuid, Vec<Uuid>)>) {
        self.state.lock().services = services;
    }

    pub(crate) fn fail_connect(&self, status: Option<CommunicationStatus>) {
        self.state.lock().fail_connect = status;
    }

    pub(crate) fn fail_services(&self, status: Option<CommunicationStatus>) {
        self.state.lock().fail_services = status;
    }

    pub(crate) fn fail_subscribe(&self, characteristic: Uuid, status: CommunicationStatus) {
        self.state.lock().fail_subscribe.insert(characteristic, status);
    }

    pub(crate) fn latest_watcher(&self) -> Option<WatcherHandle> {
        self.state.lock().latest_watcher
    }

    pub(crate) fn watcher_running(&self) -> bool {
        !self.state.lock().watchers.is_empty()
    }

    pub(crate) fn stopped_watchers(&self) -> Vec<WatcherHandle> {
        self.state.lock().stopped_watchers.clone()
    }

    /// Push an event through the most recently started watcher.
    pub(crate) fn emit(&self, kind: WatcherEventKind) {
        let state = self.state.lock();
        if let Some(handle) = state.latest_watcher {
            if let Some(tx) = state.watchers.get(&handle) {
                let _ = tx.send(WatcherEvent::new(handle, kind));
            }
        }
    }

    /// Push an already tagged event through the latest watcher's queue.
    pub(crate) fn emit_raw(&self, event: WatcherEvent) {
        let state = self.state.lock();
        if let Some(tx) = state.latest_watcher.and_then(|h| state.watchers.get(&h)) {
            let _ = tx.send(event);
        }
    }

    /// Deliver a notification to every live link of a device.
    pub(crate) fn notify(&self, id: &DeviceId, characteristic: Uuid, value: &[u8]) {
        let handlers: Vec<NotificationHandler> = self
            .state
            .lock()
            .links
            .values()
            .filter(|link| link.alive && link.id == *id)
            .filter_map(|link| link.handlers.get(&characteristic).cloned())
            .collect();

        for handler in handlers {
            handler(Bytes::copy_from_slice(value));
        }
    }

    /// Simulate the peripheral dropping every link.
    pub(crate) fn drop_link(&self, id: &DeviceId) {
        let handlers: Vec<ConnectionStatusHandler> = {
            let mut state = self.state.lock();
            state
                .links
                .values_mut()
                .filter(|link| link.alive && link.id == *id)
                .map(|link| {
                    link.alive = false;
                    link.on_status.clone()
                })
                .collect()
        };

        for handler in handlers {
            handler(ConnectionStatus::Disconnected);
        }
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub(crate) fn open_links(&self) -> usize {
        self.state.lock().links.len()
    }

    pub(crate) fn writes(&self) -> Vec<(DeviceId, Uuid, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub(crate) fn disconnects(&self) -> Vec<DeviceId> {
        self.state.lock().disconnects.clone()
    }

    fn allocate(state: &mut FakeState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn power_state(&self) -> PowerState {
        self.state.lock().power
    }

    async fn start_watcher(
        &self,
        _requested_properties: &[&str],
        events: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Result<WatcherHandle> {
        let mut state = self.state.lock();
        let handle = WatcherHandle(Self::allocate(&mut state));
        state.watchers.insert(handle, events);
        state.latest_watcher = Some(handle);
        Ok(handle)
    }

    async fn stop_watcher(&self, handle: WatcherHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.watchers.remove(&handle).is_some() {
            state.stopped_watchers.push(handle);
        }
        Ok(())
    }

    async fn connect(
        &self,
        id: &DeviceId,
        on_status: ConnectionStatusHandler,
    ) -> Result<ConnectionHandle> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if let Some(status) = state.fail_connect {
            return Err(Error::transport("connect", status));
        }

        let handle = ConnectionHandle(Self::allocate(&mut state));
        state.links.insert(
            handle,
            FakeLink {
                id: id.clone(),
                on_status,
                handlers: HashMap::new(),
                alive: true,
            },
        );
        Ok(handle)
    }

    async fn enumerate_services(&self, conn: ConnectionHandle) -> Result<Vec<Uuid>> {
        let state = self.state.lock();
        if !state.links.contains_key(&conn) {
            return Err(Error::NotConnected);
        }
        if let Some(status) = state.fail_services {
            return Err(Error::transport("enumerate services", status));
        }
        Ok(state.services.iter().map(|(uuid, _)| *uuid).collect())
    }

    async fn enumerate_characteristics(
        &self,
        conn: ConnectionHandle,
        service: Uuid,
    ) -> Result<Vec<Uuid>> {
        let state = self.state.lock();
        if !state.links.contains_key(&conn) {
            return Err(Error::NotConnected);
        }
        state
            .services
            .iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, characteristics)| characteristics.clone())
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
        if let Some(gate) = &self.subscribe_gate {
            gate.acquire().await.map_err(|_| Error::Cancelled)?.forget();
        }

        let mut state = self.state.lock();
        if let Some(status) = state.fail_subscribe.get(&characteristic).copied() {
            return Err(Error::transport("subscribe", status));
        }
        let link = state.links.get_mut(&conn).ok_or(Error::NotConnected)?;
        link.handlers.insert(characteristic, on_value);
        Ok(())
    }

    async fn write_value(
        &self,
        conn: ConnectionHandle,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let id = match state.links.get(&conn) {
            Some(link) if link.alive => link.id.clone(),
            _ => return Err(Error::NotConnected),
        };
        state.writes.push((id, characteristic, value.to_vec()));
        Ok(())
    }

    async fn disconnect(&self, conn: ConnectionHandle) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(link) = state.links.remove(&conn) {
            state.disconnects.push(link.id);
        }
        Ok(())
    }

    async fn is_connected(&self, conn: ConnectionHandle) -> bool {
        self.state
            .lock()
            .links
            .get(&conn)
            .map(|link| link.alive)
            .unwrap_or(false)
    }
}
