//! Device session management.
//!
//! A [`DeviceSession`] drives one LOGITOW brick from discovery through
//! connection, service discovery and channel subscription, then decodes the
//! notifications it receives.
//!
//! Every connect sequence is tagged with an attempt number. A disconnect, a
//! failure or a dropped link bumps the number, so any transport result that
//! arrives for an older attempt is discarded instead of being applied.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::{Advertisement, AdvertisementDelta, DeviceId};
use crate::ble::characteristics::{channel_for_service, Channel, ChannelKind, DATA_CHANNEL};
use crate::ble::connection::SessionState;
use crate::ble::uuids::MODULE_DRIVER_CHARACTERISTIC_UUID;
use crate::config::BatteryThresholds;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::protocol::{
    decode_block_payload, BatteryReading, BATTERY_REQUEST_COMMAND, BLOCK_PAYLOAD_LEN,
};
use crate::registry::DeviceRegistry;
use crate::transport::{
    ConnectionHandle, ConnectionStatus, ConnectionStatusHandler, NotificationHandler, Transport,
};

/// Lifecycle notices sessions send to the device manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionNotice {
    /// A session with an open link lost it without being asked to.
    LinkLost(DeviceId),
}

/// Shared dependencies of every session created by one registry.
pub(crate) struct SessionContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) battery: BatteryThresholds,
    pub(crate) registry: Weak<DeviceRegistry>,
    pub(crate) notices: mpsc::UnboundedSender<SessionNotice>,
}

struct SessionInner {
    state: SessionState,
    connection: Option<ConnectionHandle>,
    channels: Vec<ChannelKind>,
    battery: Option<BatteryReading>,
    connected_at: Option<DateTime<Utc>>,
    /// Last block payload forwarded, cleared once its echo is dropped.
    last_block: Option<[u8; BLOCK_PAYLOAD_LEN]>,
    attempt: u64,
}

/// One peripheral's connection lifecycle.
pub struct DeviceSession {
    id: DeviceId,
    advertisement: RwLock<Advertisement>,
    inner: Mutex<SessionInner>,
    context: Arc<SessionContext>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    pub(crate) fn new(advertisement: Advertisement, context: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            id: advertisement.id.clone(),
            advertisement: RwLock::new(advertisement),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                connection: None,
                channels: Vec::new(),
                battery: None,
                connected_at: None,
                last_block: None,
                attempt: 0,
            }),
            context,
        })
    }

    /// Peripheral identifier.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Latest advertisement seen for this peripheral.
    pub fn advertisement(&self) -> Advertisement {
        self.advertisement.read().clone()
    }

    /// Channels subscribed in the current connection.
    pub fn subscribed_channels(&self) -> Vec<ChannelKind> {
        self.inner.lock().channels.clone()
    }

    /// Last battery report received.
    pub fn battery(&self) -> Option<BatteryReading> {
        self.inner.lock().battery.clone()
    }

    /// When the session last reached `Ready`.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().connected_at
    }

    /// Merge an advertisement update; the session state is not affected.
    pub(crate) fn update_advertisement(&self, delta: &AdvertisementDelta) {
        self.advertisement.write().apply(delta);
    }

    /// Connect and subscribe to every recognised channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConnecting`] unless the session is `Idle` or
    /// `Disconnected`, [`Error::Cancelled`] if the sequence was overtaken by a
    /// disconnect, and the transport error otherwise.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let attempt = {
            let mut inner = self.inner.lock();
            if !inner.state.can_connect() {
                return Err(Error::AlreadyConnecting {
                    identifier: self.id.to_string(),
                });
            }
            inner.attempt += 1;
            inner.state = SessionState::Connecting;
            inner.channels.clear();
            inner.last_block = None;
            inner.attempt
        };
        debug!("{}: connecting (attempt {})", self.id, attempt);

        let transport = self.context.transport.clone();

        let conn = match transport.connect(&self.id, self.status_handler(attempt)).await {
            Ok(conn) => conn,
            Err(e) => return self.fail(attempt, e).await,
        };

        if !self.with_attempt(attempt, |inner| inner.connection = Some(conn)) {
            debug!("{}: releasing late connection handle", self.id);
            if let Err(e) = transport.disconnect(conn).await {
                warn!("{}: failed to release late handle: {}", self.id, e);
            }
            return Err(Error::Cancelled);
        }

        // The session only counts as linked once the registry accepts it.
        if let Some(registry) = self.context.registry.upgrade() {
            if let Err(e) = registry.mark_connected(self) {
                return self.fail(attempt, e).await;
            }
        }
        if !self.with_attempt(attempt, |inner| {
            inner.state = SessionState::DiscoveringServices;
        }) {
            self.retire();
            return Err(Error::Cancelled);
        }
        info!("{}: link established", self.id);

        let services = match transport.enumerate_services(conn).await {
            Ok(services) => services,
            Err(e) => return self.fail(attempt, e).await,
        };
        self.ensure_current(attempt)?;
        debug!("{}: {} services", self.id, services.len());

        let mut channels: Vec<Channel> = services.iter().filter_map(channel_for_service).collect();
        channels.sort_by_key(|channel| channel.kind);
        channels.dedup();
        if !channels.contains(&DATA_CHANNEL) {
            let err = Error::ServiceNotFound {
                uuid: DATA_CHANNEL.service.to_string(),
            };
            return self.fail(attempt, err).await;
        }

        if !self.with_attempt(attempt, |inner| {
            inner.state = SessionState::SubscribingChannels;
        }) {
            return Err(Error::Cancelled);
        }

        for channel in channels {
            if let Err(e) = self.subscribe_channel(conn, channel, attempt).await {
                return self.fail(attempt, e).await;
            }
        }

        let ready = self.with_attempt(attempt, |inner| {
            inner.state = SessionState::Ready;
            inner.connected_at = Some(Utc::now());
        });
        if !ready {
            return Err(Error::Cancelled);
        }

        info!("{}: ready", self.id);
        self.context.sink.on_device_connected(&self.id);
        Ok(())
    }

    async fn subscribe_channel(
        self: &Arc<Self>,
        conn: ConnectionHandle,
        channel: Channel,
        attempt: u64,
    ) -> Result<()> {
        let transport = &self.context.transport;

        let characteristics = transport
            .enumerate_characteristics(conn, channel.service)
            .await?;
        self.ensure_current(attempt)?;

        if !characteristics.contains(&channel.characteristic) {
            if channel.required {
                return Err(Error::CharacteristicNotFound {
                    uuid: channel.characteristic.to_string(),
                });
            }
            warn!(
                "{}: {} characteristic missing, channel skipped",
                self.id, channel.kind
            );
            return Ok(());
        }

        transport
            .subscribe_notify(
                conn,
                channel.characteristic,
                self.notification_handler(channel.kind, attempt),
            )
            .await?;
        if !self.with_attempt(attempt, |inner| inner.channels.push(channel.kind)) {
            return Err(Error::Cancelled);
        }
        debug!("{}: subscribed to {} channel", self.id, channel.kind);

        if channel.kind == ChannelKind::Battery {
            transport
                .write_value(conn, MODULE_DRIVER_CHARACTERISTIC_UUID, &BATTERY_REQUEST_COMMAND)
                .await?;
            self.ensure_current(attempt)?;
        }
        Ok(())
    }

    /// Close the link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the session is `Idle` or
    /// `Disconnected`.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let conn = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Idle | SessionState::Disconnected => {
                    return Err(Error::NotConnected);
                }
                SessionState::Disconnecting | SessionState::Failed => {
                    debug!("{}: teardown already in progress", self.id);
                    return Ok(());
                }
                _ => {}
            }
            inner.state = SessionState::Disconnecting;
            inner.attempt += 1;
            inner.channels.clear();
            inner.connection.take()
        };
        info!("{}: disconnecting", self.id);

        if let Some(conn) = conn {
            if let Err(e) = self.context.transport.disconnect(conn).await {
                warn!("{}: failed to release connection: {}", self.id, e);
            }
        }
        self.retire();

        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disconnecting {
                inner.state = SessionState::Disconnected;
            }
        }
        self.context.sink.on_device_disconnected(&self.id);
        Ok(())
    }

    /// Ask the brick for a battery report.
    ///
    /// The answer arrives later as a battery notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the battery channel is
    /// subscribed and the transport reports the link as up.
    pub async fn request_battery_status(self: &Arc<Self>) -> Result<()> {
        let target = {
            let inner = self.inner.lock();
            if inner.state.is_ready() && inner.channels.contains(&ChannelKind::Battery) {
                inner.connection.map(|conn| (conn, inner.attempt))
            } else {
                None
            }
        };
        let Some((conn, attempt)) = target else {
            warn!("{}: battery requested without a battery channel", self.id);
            return Err(Error::NotConnected);
        };

        let transport = &self.context.transport;
        if !transport.is_connected(conn).await {
            warn!("{}: battery requested but the link is down", self.id);
            return Err(Error::NotConnected);
        }

        trace!("{}: requesting battery status", self.id);
        match transport
            .write_value(conn, MODULE_DRIVER_CHARACTERISTIC_UUID, &BATTERY_REQUEST_COMMAND)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => self.fail(attempt, e).await,
        }
    }

    /// Run `f` on the inner state if `attempt` is still the live attempt and
    /// no teardown has started.
    fn with_attempt(&self, attempt: u64, f: impl FnOnce(&mut SessionInner)) -> bool {
        let mut inner = self.inner.lock();
        if inner.attempt != attempt || !is_live(inner.state) {
            return false;
        }
        f(&mut inner);
        true
    }

    fn ensure_current(&self, attempt: u64) -> Result<()> {
        if self.with_attempt(attempt, |_| {}) {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Tear down after a transport error.
    async fn fail<T>(self: &Arc<Self>, attempt: u64, err: Error) -> Result<T> {
        if matches!(err, Error::Cancelled) {
            return Err(err);
        }

        let mut was_linked = false;
        let mut conn = None;
        let current = self.with_attempt(attempt, |inner| {
            was_linked = inner.state.is_connected();
            inner.state = SessionState::Failed;
            inner.attempt += 1;
            inner.channels.clear();
            conn = inner.connection.take();
        });
        if !current {
            debug!("{}: ignoring error from stale attempt: {}", self.id, err);
            return Err(Error::Cancelled);
        }

        warn!("{}: connection error: {}", self.id, err);
        self.context.sink.on_connection_error(&self.id, err.status());

        if let Some(conn) = conn {
            if let Err(e) = self.context.transport.disconnect(conn).await {
                warn!("{}: failed to release connection: {}", self.id, e);
            }
        }
        // A session that never linked stays discovered and can be retried.
        if was_linked {
            self.retire();
        }

        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Failed {
                inner.state = SessionState::Disconnected;
            }
        }

        if was_linked {
            self.context.sink.on_device_disconnected(&self.id);
            let _ = self
                .context
                .notices
                .send(SessionNotice::LinkLost(self.id.clone()));
        }
        Err(err)
    }

    /// Handle a link drop reported by the transport.
    fn on_link_lost(self: &Arc<Self>, attempt: u64) {
        let conn = {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt || !inner.state.is_connected() {
                return;
            }
            inner.state = SessionState::Disconnected;
            inner.attempt += 1;
            inner.channels.clear();
            inner.connection.take()
        };
        info!("{}: link lost", self.id);

        if let Some(conn) = conn {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let transport = self.context.transport.clone();
                    let id = self.id.clone();
                    runtime.spawn(async move {
                        if let Err(e) = transport.disconnect(conn).await {
                            warn!("{}: failed to release connection: {}", id, e);
                        }
                    });
                }
                Err(_) => warn!("{}: no runtime to release the connection", self.id),
            }
        }
        self.retire();

        self.context.sink.on_device_disconnected(&self.id);
        let _ = self
            .context
            .notices
            .send(SessionNotice::LinkLost(self.id.clone()));
    }

    fn on_notification(&self, kind: ChannelKind, attempt: u64, value: &Bytes) {
        let accepted = {
            let inner = self.inner.lock();
            inner.attempt == attempt && inner.state.accepts_notifications()
        };
        if !accepted {
            trace!("{}: dropping notification for old connection", self.id);
            return;
        }

        match kind {
            ChannelKind::Data => match decode_block_payload(value) {
                Ok(data) => {
                    self.mark_streaming(attempt);
                    if self.is_block_echo(data) {
                        trace!("{}: dropping repeated block data {:02x?}", self.id, data);
                        return;
                    }
                    trace!("{}: block data {:02x?}", self.id, data);
                    self.context.sink.on_block_data_received(&self.id, data);
                }
                Err(e) => warn!("{}: {}", self.id, e),
            },
            ChannelKind::Battery => match BatteryReading::from_payload(value) {
                Ok(reading) => {
                    self.mark_streaming(attempt);
                    let volts = reading.voltage;
                    let low = reading.is_low_charge(&self.context.battery);
                    self.inner.lock().battery = Some(reading);

                    debug!("{}: battery {:.1} V", self.id, volts);
                    self.context.sink.on_battery_info_received(&self.id, volts);
                    if low {
                        warn!("{}: battery low ({:.1} V)", self.id, volts);
                        self.context.sink.on_battery_low(&self.id, volts);
                    }
                }
                Err(e) => warn!("{}: {}", self.id, e),
            },
        }
    }

    /// A brick repeats each block payload once to confirm it. The repeat is
    /// dropped and the cache cleared, so a third copy is a new operation.
    fn is_block_echo(&self, data: [u8; BLOCK_PAYLOAD_LEN]) -> bool {
        let mut inner = self.inner.lock();
        if inner.last_block == Some(data) {
            inner.last_block = None;
            true
        } else {
            inner.last_block = Some(data);
            false
        }
    }

    fn mark_streaming(&self, attempt: u64) {
        let mut inner = self.inner.lock();
        if inner.attempt == attempt && inner.state == SessionState::Ready {
            inner.state = SessionState::Streaming;
            debug!("{}: streaming", self.id);
        }
    }

    fn retire(self: &Arc<Self>) {
        if let Some(registry) = self.context.registry.upgrade() {
            registry.retire(self);
        }
    }

    fn notification_handler(
        self: &Arc<Self>,
        kind: ChannelKind,
        attempt: u64,
    ) -> NotificationHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |value: Bytes| {
            if let Some(session) = session.upgrade() {
                session.on_notification(kind, attempt, &value);
            }
        })
    }

    fn status_handler(self: &Arc<Self>, attempt: u64) -> ConnectionStatusHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |status: ConnectionStatus| {
            let Some(session) = session.upgrade() else {
                return;
            };
            match status {
                ConnectionStatus::Connected => {
                    trace!("{}: transport reports link up", session.id);
                }
                ConnectionStatus::Disconnected => session.on_link_lost(attempt),
            }
        })
    }
}

/// States in which a connect sequence may still make progress.
fn is_live(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::Connecting
            | SessionState::DiscoveringServices
            | SessionState::SubscribingChannels
            | SessionState::Ready
            | SessionState::Streaming
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use crate::events::{ManagerEvent, RecordingSink};
    use crate::transport::fake::FakeTransport;
    use crate::transport::CommunicationStatus;
    use pretty_assertions::assert_eq;

    fn session_with(
        transport: Arc<FakeTransport>,
        sink: Arc<RecordingSink>,
    ) -> (Arc<DeviceSession>, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let context = Arc::new(SessionContext {
            transport,
            sink,
            battery: BatteryThresholds::default(),
            registry: Weak::new(),
            notices,
        });
        let advertisement = Advertisement::new("brick-1")
            .with_name("LOGITOW")
            .with_connectable(true);
        (DeviceSession::new(advertisement, context), rx)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_connect_subscribes_both_channels() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink.clone());

        session.connect().await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            session.subscribed_channels(),
            vec![ChannelKind::Data, ChannelKind::Battery]
        );
        assert!(session.connected_at().is_some());
        assert_eq!(
            sink.events(),
            vec![ManagerEvent::DeviceConnected("brick-1".into())]
        );

        // Priming battery request.
        assert_eq!(
            transport.writes(),
            vec![(
                DeviceId::from("brick-1"),
                MODULE_DRIVER_CHARACTERISTIC_UUID,
                vec![0xAD, 0x02]
            )]
        );
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (transport, gate) = FakeTransport::gated();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport, sink);

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        eventually(|| session.state() == SessionState::SubscribingChannels).await;

        assert!(matches!(
            session.connect().await,
            Err(Error::AlreadyConnecting { .. })
        ));

        gate.add_permits(2);
        connecting.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_notifications_are_decoded() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink.clone());
        session.connect().await.unwrap();
        sink.clear();

        let id = DeviceId::from("brick-1");
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &[1, 2, 3, 4, 5, 6, 7]);
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &[1, 2, 3]);
        transport.notify(&id, MODULE_DRIVER_CHARACTERISTIC_UUID, &[3, 7]);

        assert_eq!(session.state(), SessionState::Streaming);
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ManagerEvent::BlockData {
                id: id.clone(),
                data: [1, 2, 3, 4, 5, 6, 7],
            }
        );
        match &events[1] {
            ManagerEvent::BatteryInfo { volts, .. } => assert!((volts - 3.7).abs() < 1e-6),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(session.battery().is_some());
    }

    #[tokio::test]
    async fn test_repeated_block_payload_is_dropped() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink.clone());
        session.connect().await.unwrap();
        sink.clear();

        let id = DeviceId::from("brick-1");
        let attach = [0, 0, 1, 5, 0, 0, 2];
        let detach = [0, 0, 1, 5, 0, 0, 0];
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &attach);
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &attach);
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &detach);
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &detach);
        // Once the echo is consumed the same payload counts again.
        transport.notify(&id, DATA_READ_CHARACTERISTIC_UUID, &attach);

        assert_eq!(
            sink.events(),
            vec![
                ManagerEvent::BlockData {
                    id: id.clone(),
                    data: attach,
                },
                ManagerEvent::BlockData {
                    id: id.clone(),
                    data: detach,
                },
                ManagerEvent::BlockData { id, data: attach },
            ]
        );
    }

    #[tokio::test]
    async fn test_low_battery_is_reported() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink.clone());
        session.connect().await.unwrap();

        transport.notify(&"brick-1".into(), MODULE_DRIVER_CHARACTERISTIC_UUID, &[0, 1]);

        assert_eq!(
            sink.count(|e| matches!(e, ManagerEvent::BatteryLow { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let transport = FakeTransport::new();
        transport.fail_connect(Some(CommunicationStatus::Unreachable));
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport, sink.clone());

        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            sink.events(),
            vec![ManagerEvent::ConnectionError {
                id: "brick-1".into(),
                status: CommunicationStatus::Unreachable,
            }]
        );
    }

    #[tokio::test]
    async fn test_retry_after_connect_failure() {
        let transport = FakeTransport::new();
        transport.fail_connect(Some(CommunicationStatus::Unreachable));
        let sink = RecordingSink::new();
        let (session, mut rx) = session_with(transport.clone(), sink.clone());

        assert!(session.connect().await.is_err());
        assert!(rx.try_recv().is_err());

        transport.fail_connect(None);
        session.connect().await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(transport.connect_calls(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, ManagerEvent::DeviceDisconnected(_))),
            0
        );
    }

    #[tokio::test]
    async fn test_service_enumeration_failure_tears_down() {
        let transport = FakeTransport::new();
        transport.fail_services(Some(CommunicationStatus::ProtocolError));
        let sink = RecordingSink::new();
        let (session, mut rx) = session_with(transport.clone(), sink.clone());

        assert!(matches!(
            session.connect().await,
            Err(Error::Transport {
                status: CommunicationStatus::ProtocolError,
                ..
            })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.open_links(), 0);
        assert_eq!(transport.disconnects(), vec![DeviceId::from("brick-1")]);
        assert_eq!(
            sink.events(),
            vec![
                ManagerEvent::ConnectionError {
                    id: "brick-1".into(),
                    status: CommunicationStatus::ProtocolError,
                },
                ManagerEvent::DeviceDisconnected("brick-1".into()),
            ]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionNotice::LinkLost("brick-1".into())
        );
    }

    #[tokio::test]
    async fn test_subscribe_failure_tears_down() {
        let transport = FakeTransport::new();
        transport.fail_subscribe(DATA_READ_CHARACTERISTIC_UUID, CommunicationStatus::AccessDenied);
        let sink = RecordingSink::new();
        let (session, mut rx) = session_with(transport.clone(), sink.clone());

        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.open_links(), 0);
        assert_eq!(
            sink.events(),
            vec![
                ManagerEvent::ConnectionError {
                    id: "brick-1".into(),
                    status: CommunicationStatus::AccessDenied,
                },
                ManagerEvent::DeviceDisconnected("brick-1".into()),
            ]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionNotice::LinkLost("brick-1".into())
        );
    }

    #[tokio::test]
    async fn test_missing_data_service_fails() {
        let transport = FakeTransport::new();
        transport.set_services(vec![(
            MODULE_DRIVER_SERVICE_UUID,
            vec![MODULE_DRIVER_CHARACTERISTIC_UUID],
        )]);
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport, sink.clone());

        assert!(matches!(
            session.connect().await,
            Err(Error::ServiceNotFound { .. })
        ));
        assert_eq!(
            sink.count(|e| matches!(e, ManagerEvent::DeviceConnected(_))),
            0
        );
    }

    #[tokio::test]
    async fn test_battery_service_is_optional() {
        let transport = FakeTransport::new();
        transport.set_services(vec![(DATA_SERVICE_UUID, vec![DATA_READ_CHARACTERISTIC_UUID])]);
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink);

        session.connect().await.unwrap();
        assert_eq!(session.subscribed_channels(), vec![ChannelKind::Data]);
        assert!(transport.writes().is_empty());

        assert!(matches!(
            session.request_battery_status().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_while_subscribing() {
        let (transport, gate) = FakeTransport::gated();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink.clone());

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        eventually(|| session.state() == SessionState::SubscribingChannels).await;

        session.disconnect().await.unwrap();
        gate.add_permits(2);

        assert!(matches!(connecting.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            sink.events(),
            vec![ManagerEvent::DeviceDisconnected("brick-1".into())]
        );
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport, sink.clone());

        assert!(matches!(session.disconnect().await, Err(Error::NotConnected)));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_link_loss() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, mut rx) = session_with(transport.clone(), sink.clone());
        session.connect().await.unwrap();
        sink.clear();

        transport.drop_link(&"brick-1".into());

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            sink.events(),
            vec![ManagerEvent::DeviceDisconnected("brick-1".into())]
        );
        assert_eq!(
            rx.recv().await,
            Some(SessionNotice::LinkLost("brick-1".into()))
        );
        eventually(|| transport.open_links() == 0).await;

        // Notifications for the dropped connection are ignored.
        transport.notify(&"brick-1".into(), DATA_READ_CHARACTERISTIC_UUID, &[0; 7]);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_request_battery_status() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink);

        assert!(matches!(
            session.request_battery_status().await,
            Err(Error::NotConnected)
        ));

        session.connect().await.unwrap();
        session.request_battery_status().await.unwrap();
        assert_eq!(transport.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let transport = FakeTransport::new();
        let sink = RecordingSink::new();
        let (session, _rx) = session_with(transport.clone(), sink.clone());

        session.connect().await.unwrap();
        session.disconnect().await.unwrap();
        session.connect().await.unwrap();

        assert_eq!(transport.connect_calls(), 2);
        assert_eq!(transport.open_links(), 1);
        assert_eq!(
            sink.count(|e| matches!(e, ManagerEvent::DeviceDisconnected(_))),
            1
        );
    }
}
