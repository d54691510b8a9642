//! Device manager for discovering and connecting LOGITOW bricks.
//!
//! This is the host-facing entry point. It owns the registry, the scan
//! controller and the background task that restarts discovery after a
//! connected brick drops.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::advertising::DeviceId;
use crate::ble::scanner::ScanController;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::registry::{DeviceRegistry, RegistryEntry, Scope};
use crate::session::{DeviceSession, SessionNotice};
use crate::transport::btleplug::BtleplugTransport;
use crate::transport::{PowerState, Transport};

/// Central manager for LOGITOW devices.
pub struct DeviceManager {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    scanner: Arc<ScanController>,
    /// Background task handling session notices.
    background_handle: JoinHandle<()>,
}

impl DeviceManager {
    /// Create a manager over an arbitrary transport.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the configuration is invalid.
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let registry = DeviceRegistry::new(transport.clone(), sink.clone(), &config, notices_tx);
        let scanner = Arc::new(ScanController::new(transport.clone(), registry.clone(), sink));

        let background_handle = tokio::spawn(Self::handle_notices(
            notices_rx,
            Arc::downgrade(&scanner),
            config.restart_scan_on_disconnect,
        ));

        Ok(Self {
            config,
            transport,
            registry,
            scanner,
            background_handle,
        })
    }

    /// Create a manager on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_btleplug(sink: Arc<dyn EventSink>, config: ManagerConfig) -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Self::new(Arc::new(transport), sink, config)
    }

    async fn handle_notices(
        mut rx: mpsc::UnboundedReceiver<SessionNotice>,
        scanner: std::sync::Weak<ScanController>,
        restart_scan: bool,
    ) {
        while let Some(notice) = rx.recv().await {
            match notice {
                SessionNotice::LinkLost(id) => {
                    if !restart_scan {
                        debug!("{} dropped, scan restart disabled", id);
                        continue;
                    }
                    let Some(scanner) = scanner.upgrade() else {
                        break;
                    };
                    info!("{} dropped, restarting scan", id);
                    if let Err(e) = scanner.restart().await {
                        warn!("Failed to restart scan: {}", e);
                    }
                }
            }
        }
        debug!("Device manager background task ended");
    }

    /// The active configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Start scanning for devices.
    pub async fn start_scan(&self) -> Result<()> {
        self.scanner.start().await
    }

    /// Stop scanning for devices.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop().await
    }

    /// Check if currently scanning.
    pub async fn is_scanning(&self) -> bool {
        self.scanner.is_scanning().await
    }

    /// Radio power state.
    pub async fn bluetooth_state(&self) -> PowerState {
        self.transport.power_state().await
    }

    /// Connect to a discovered device.
    ///
    /// If the device is already connected, the existing session is
    /// disconnected first and a fresh session is connected in its place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] for an identifier the registry does
    /// not track, [`Error::MaxConnectionsReached`] when the connection bound
    /// is hit, or the session's connect error.
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        let session = match self.registry.find(id, Scope::Connected) {
            Some(RegistryEntry::Session(existing)) => {
                info!("Reconnecting {}", id);
                if let Err(e) = existing.disconnect().await {
                    debug!("Existing session for {} was already down: {}", id, e);
                }
                self.registry.renew_session(&existing)
            }
            _ => self
                .registry
                .find(id, Scope::Discovered)
                .and_then(RegistryEntry::session)
                .ok_or_else(|| Error::DeviceNotFound {
                    identifier: id.to_string(),
                })?,
        };

        if self.registry.connected_count() >= self.config.max_connections {
            return Err(Error::MaxConnectionsReached {
                max: self.config.max_connections,
            });
        }

        session.connect().await
    }

    /// Disconnect a device.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.session(id)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?
            .disconnect()
            .await
    }

    /// Ask a connected device for a battery report.
    pub async fn request_battery(&self, id: &DeviceId) -> Result<()> {
        self.session(id)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?
            .request_battery_status()
            .await
    }

    /// Look up a discovered or connected session.
    pub fn session(&self, id: &DeviceId) -> Option<Arc<DeviceSession>> {
        self.registry.session(id)
    }

    /// Identifiers of discovered, not connected, devices.
    pub fn discovered_devices(&self) -> Vec<DeviceId> {
        self.registry.discovered_ids()
    }

    /// Identifiers of connected devices.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.registry.connected_ids()
    }

    /// Stop scanning and disconnect every device.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        let scan_result = self.scanner.stop().await;

        let mut sessions: Vec<Arc<DeviceSession>> = self
            .registry
            .connected_ids()
            .iter()
            .filter_map(|id| self.registry.session(id))
            .collect();
        sessions.extend(
            self.registry
                .discovered_ids()
                .iter()
                .filter_map(|id| self.registry.session(id))
                .filter(|s| s.state().is_transitioning()),
        );

        for session in sessions {
            if let Err(e) = session.disconnect().await {
                debug!("Disconnect of {} during shutdown: {}", session.id(), e);
            }
        }

        scan_result
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.background_handle.abort();
    }
}
