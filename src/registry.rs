//! Device registry.
//!
//! Tracks every peripheral the current scan has reported, in three disjoint
//! places:
//!
//! - **unknown**: advertisements whose name has not resolved to the target
//!   identity yet
//! - **discovered**: LOGITOW sessions that are not connected
//! - **connected**: sessions with an open link
//!
//! Unknown and discovered share one lock; the connected index has its own.
//! When both are needed the discovery lock is taken first. Sink callbacks
//! always run after the locks are released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::{Advertisement, AdvertisementDelta, DeviceId};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::session::{DeviceSession, SessionContext, SessionNotice};
use crate::transport::Transport;

/// Which collection a lookup searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Advertisements that have not been classified yet.
    Unknown,
    /// LOGITOW sessions that are not connected.
    Discovered,
    /// Sessions in the connected index.
    Connected,
}

/// Result of a registry lookup.
#[derive(Debug, Clone)]
pub enum RegistryEntry {
    /// An unclassified advertisement.
    Unknown(Advertisement),
    /// A LOGITOW session.
    Session(Arc<DeviceSession>),
}

impl RegistryEntry {
    /// The session, if this entry holds one.
    pub fn session(self) -> Option<Arc<DeviceSession>> {
        match self {
            Self::Session(session) => Some(session),
            Self::Unknown(_) => None,
        }
    }
}

/// How an advertisement relates to the target identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    /// The name has not resolved yet.
    Unresolved,
    /// Target name, but not connectable yet.
    Pending,
    /// Target name and connectable.
    Match,
    /// Some other device.
    Foreign,
}

#[derive(Default)]
struct DiscoveryState {
    unknown: HashMap<DeviceId, Advertisement>,
    discovered: HashMap<DeviceId, Arc<DeviceSession>>,
}

/// Registry of devices seen by the current scan.
pub struct DeviceRegistry {
    target_name: String,
    max_connections: usize,
    auto_connect: bool,
    context: Arc<SessionContext>,
    state: Mutex<DiscoveryState>,
    connected: Mutex<HashMap<DeviceId, Arc<DeviceSession>>>,
}

impl DeviceRegistry {
    /// Create a registry whose sessions send lifecycle notices on `notices`.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        config: &ManagerConfig,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| Self {
            target_name: config.target_name.clone(),
            max_connections: config.max_connections,
            auto_connect: config.auto_connect,
            context: Arc::new(SessionContext {
                transport,
                sink,
                battery: config.battery.clone(),
                registry: me.clone(),
                notices,
            }),
            state: Mutex::new(DiscoveryState::default()),
            connected: Mutex::new(HashMap::new()),
        })
    }

    fn classify(&self, advertisement: &Advertisement) -> Classification {
        match advertisement.resolved_name() {
            None => Classification::Unresolved,
            Some(name) if name == self.target_name => {
                if advertisement.is_connectable() {
                    Classification::Match
                } else {
                    Classification::Pending
                }
            }
            Some(_) => Classification::Foreign,
        }
    }

    /// Handle a first sighting.
    pub fn on_advertisement_seen(&self, advertisement: Advertisement) {
        let id = advertisement.id.clone();
        let promoted = {
            let mut state = self.state.lock();
            if state.discovered.contains_key(&id) || self.connected.lock().contains_key(&id) {
                trace!("Ignoring advertisement for known device {}", id);
                return;
            }

            let advertisement = match state.unknown.remove(&id) {
                Some(mut tracked) => {
                    tracked.apply(&AdvertisementDelta::from(advertisement));
                    tracked
                }
                None => advertisement,
            };

            match self.classify(&advertisement) {
                Classification::Unresolved | Classification::Pending => {
                    trace!("Tracking unresolved advertisement {}", id);
                    state.unknown.insert(id, advertisement);
                    None
                }
                Classification::Match => Some(self.promote(&mut state, advertisement)),
                Classification::Foreign => None,
            }
        };

        if let Some(session) = promoted {
            self.announce(session);
        }
    }

    /// Handle an advertisement change.
    pub fn on_advertisement_updated(&self, delta: AdvertisementDelta) {
        let mut forward = None;
        let mut promoted = None;
        {
            let mut state = self.state.lock();
            let known = state
                .discovered
                .get(&delta.id)
                .cloned()
                .or_else(|| self.connected.lock().get(&delta.id).cloned());

            if let Some(session) = known {
                forward = Some(session);
            } else if let Some(advertisement) = state.unknown.get_mut(&delta.id) {
                advertisement.apply(&delta);
                match self.classify(advertisement) {
                    Classification::Match => {
                        if let Some(advertisement) = state.unknown.remove(&delta.id) {
                            promoted = Some(self.promote(&mut state, advertisement));
                        }
                    }
                    Classification::Foreign => {
                        trace!("Dropping foreign device {}", delta.id);
                        state.unknown.remove(&delta.id);
                    }
                    Classification::Unresolved | Classification::Pending => {}
                }
            } else {
                trace!("Ignoring update for untracked device {}", delta.id);
            }
        }

        if let Some(session) = forward {
            session.update_advertisement(&delta);
        }
        if let Some(session) = promoted {
            self.announce(session);
        }
    }

    /// Handle a peripheral going out of sight.
    pub fn on_advertisement_lost(&self, id: &DeviceId) {
        let lost = {
            let mut state = self.state.lock();
            if state.unknown.remove(id).is_some() {
                None
            } else {
                state.discovered.remove(id)
            }
        };

        if lost.is_some() {
            info!("Lost LOGITOW device {}", id);
            self.context.sink.on_device_lost(id);
        }
    }

    /// Handle the end of the watcher's initial enumeration.
    pub fn on_enumeration_completed(&self) {
        let state = self.state.lock();
        info!(
            "Initial enumeration complete: {} LOGITOW devices, {} unresolved",
            state.discovered.len(),
            state.unknown.len()
        );
    }

    /// Forget all unknown and discovered devices.
    ///
    /// Connected sessions are kept. A lost event is emitted for every
    /// discarded discovered device.
    pub fn reset(&self) {
        let lost: Vec<DeviceId> = {
            let mut state = self.state.lock();
            state.unknown.clear();
            state.discovered.drain().map(|(id, _)| id).collect()
        };

        debug!("Registry reset, {} discovered devices discarded", lost.len());
        for id in &lost {
            self.context.sink.on_device_lost(id);
        }
    }

    /// Look an identifier up in one collection.
    pub fn find(&self, id: &DeviceId, scope: Scope) -> Option<RegistryEntry> {
        match scope {
            Scope::Unknown => self
                .state
                .lock()
                .unknown
                .get(id)
                .cloned()
                .map(RegistryEntry::Unknown),
            Scope::Discovered => self
                .state
                .lock()
                .discovered
                .get(id)
                .cloned()
                .map(RegistryEntry::Session),
            Scope::Connected => self
                .connected
                .lock()
                .get(id)
                .cloned()
                .map(RegistryEntry::Session),
        }
    }

    /// The session for an identifier, discovered or connected.
    pub fn session(&self, id: &DeviceId) -> Option<Arc<DeviceSession>> {
        self.find(id, Scope::Connected)
            .or_else(|| self.find(id, Scope::Discovered))
            .and_then(RegistryEntry::session)
    }

    /// Identifiers of discovered, not connected, devices.
    pub fn discovered_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.state.lock().discovered.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Identifiers of connected devices.
    pub fn connected_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.connected.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of unclassified advertisements.
    pub fn unknown_count(&self) -> usize {
        self.state.lock().unknown.len()
    }

    /// Number of connected sessions.
    pub fn connected_count(&self) -> usize {
        self.connected.lock().len()
    }

    /// Replace a retired session with a fresh one built from its last
    /// advertisement. The new session is placed in discovered.
    pub(crate) fn renew_session(&self, old: &Arc<DeviceSession>) -> Arc<DeviceSession> {
        let session = DeviceSession::new(old.advertisement(), self.context.clone());
        self.state
            .lock()
            .discovered
            .insert(session.id().clone(), session.clone());
        debug!("Renewed session for {}", session.id());
        session
    }

    /// Move a session whose link just opened into the connected index.
    pub(crate) fn mark_connected(&self, session: &Arc<DeviceSession>) -> Result<()> {
        let id = session.id();
        let mut state = self.state.lock();
        let mut connected = self.connected.lock();

        if let Some(existing) = connected.get(id) {
            if !Arc::ptr_eq(existing, session) && existing.is_connected() {
                warn!("{} already has a live session", id);
                return Err(Error::AlreadyConnecting {
                    identifier: id.to_string(),
                });
            }
        } else if connected.len() >= self.max_connections {
            return Err(Error::MaxConnectionsReached {
                max: self.max_connections,
            });
        }

        if state
            .discovered
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            state.discovered.remove(id);
        }
        connected.insert(id.clone(), session.clone());
        Ok(())
    }

    /// Remove a session from every collection it is still in.
    pub(crate) fn retire(&self, session: &Arc<DeviceSession>) {
        let id = session.id();
        let mut state = self.state.lock();
        let mut connected = self.connected.lock();

        if state
            .discovered
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            state.discovered.remove(id);
        }
        if connected
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            connected.remove(id);
        }
    }

    fn promote(
        &self,
        state: &mut DiscoveryState,
        advertisement: Advertisement,
    ) -> Arc<DeviceSession> {
        let id = advertisement.id.clone();
        state.unknown.remove(&id);
        let session = DeviceSession::new(advertisement, self.context.clone());
        state.discovered.insert(id, session.clone());
        session
    }

    fn announce(&self, session: Arc<DeviceSession>) {
        info!("Discovered LOGITOW device {}", session.id());
        self.context.sink.on_device_discovered(session.id());

        if !self.auto_connect {
            return;
        }
        if self.connected_count() >= self.max_connections {
            debug!(
                "Not auto-connecting {}: {} devices already connected",
                session.id(),
                self.max_connections
            );
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.connect().await {
                        debug!("Auto-connect to {} failed: {}", session.id(), e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to auto-connect {}", session.id()),
        }
    }
}
